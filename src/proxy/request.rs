use anyhow::{anyhow, bail, Context, Result};
use http::{Method, Uri};

/// A proxy request after parsing the request line. Forward-proxy clients send
/// absolute-form targets (`GET http://host/path HTTP/1.1`); the parsed pieces
/// drive blocking, cache keying, and the origin-form request we re-emit.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    /// `None` for origin-form targets, which the proxy rejects after the
    /// blocking check.
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    /// Path plus query, origin-form, never empty.
    pub path: String,
    /// The absolute URL string used for cache keying.
    pub url: String,
}

impl ParsedRequest {
    /// Host with the port appended when it differs from the scheme default,
    /// suitable for the outbound `Host` header.
    pub fn authority(&self) -> String {
        let default_port = match self.scheme.as_deref() {
            Some("https") => 443,
            _ => 80,
        };
        if self.port == default_port {
            self.host.clone()
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_request_target(
    method: Method,
    target: &str,
    host_header: Option<&str>,
) -> Result<ParsedRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| "/".to_string());

    if let Some(scheme) = uri.scheme_str() {
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("request target '{target}' missing authority"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        if host.is_empty() {
            bail!("request target '{target}' missing hostname");
        }
        let port = authority.port_u16().unwrap_or(match scheme {
            "https" => 443,
            _ => 80,
        });
        let url = format!("{scheme}://{}{path}", authority.as_str());
        return Ok(ParsedRequest {
            method,
            scheme: Some(scheme.to_string()),
            host,
            port,
            path,
            url,
        });
    }

    // Origin-form target: no scheme to forward with. The host still feeds the
    // blocking check before the request is rejected.
    let (host, port) = match host_header {
        Some(value) => parse_host_port(value, 80)
            .map(|target| (target.host, target.port))
            .unwrap_or_else(|_| (String::new(), 80)),
        None => (String::new(), 80),
    };
    Ok(ParsedRequest {
        method,
        scheme: None,
        host,
        port,
        path,
        url: target.to_string(),
    })
}

/// `CONNECT` target: `host:port`, defaulting to 443 when the port is absent.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_connect_target(target: &str) -> Result<ConnectTarget> {
    parse_host_port(target, 443)
        .with_context(|| format!("invalid CONNECT target '{target}'"))
}

fn parse_host_port(value: &str, default_port: u16) -> Result<ConnectTarget> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty host");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("host must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("host must not contain userinfo");
    }
    if trimmed.contains('/') || trimmed.contains('?') || trimmed.contains('#') {
        bail!("host must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid host '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("missing hostname in '{trimmed}'"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok(ConnectTarget {
        host,
        port: uri.port_u16().unwrap_or(default_port),
    })
}
