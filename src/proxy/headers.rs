use std::collections::HashSet;
use std::net::SocketAddr;

/// A single header as it appeared on the wire. Order and multiplicity of the
/// surrounding `Vec<HeaderLine>` are preserved end to end; some response
/// semantics (repeated `Set-Cookie`, `Via` chains) depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Hop-by-hop headers per RFC 7230 §6.1. These never survive a proxy hop in
/// either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(lower_name: &str) -> bool {
    HOP_BY_HOP.contains(&lower_name)
}

/// Collects the comma-separated tokens of every `Connection` header value,
/// trimmed and lowercased.
pub fn connection_tokens(headers: &[HeaderLine]) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for header in headers {
        if header.lower_name() != "connection" {
            continue;
        }
        for token in header.value.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            tokens.insert(trimmed.to_ascii_lowercase());
        }
    }
    tokens
}

pub fn strip_hop_headers(headers: &mut Vec<HeaderLine>) {
    headers.retain(|header| !is_hop_by_hop(header.lower_name()));
}

/// Removes every header named by a `Connection` token. Applied in addition to
/// the fixed hop-by-hop strip.
pub fn strip_connection_listed(headers: &mut Vec<HeaderLine>) {
    let tokens = connection_tokens(headers);
    if tokens.is_empty() {
        return;
    }
    headers.retain(|header| !tokens.contains(header.lower_name()));
}

/// The full forwarding strip: `Connection`-listed first (the `Connection`
/// header itself is still present to read tokens from), then the fixed set.
pub fn sanitize_forwarded(headers: &mut Vec<HeaderLine>) {
    strip_connection_listed(headers);
    strip_hop_headers(headers);
}

/// Appends the immediate client IP to `X-Forwarded-For`, preserving prior
/// values in order: `"<prior1>, <prior2>, <client_ip>"`. The result is a
/// single header line replacing any existing ones.
pub fn append_forwarded_for(headers: &mut Vec<HeaderLine>, client_ip: &str) {
    let prior: Vec<String> = headers
        .iter()
        .filter(|header| header.lower_name() == "x-forwarded-for")
        .map(|header| header.value.clone())
        .collect();
    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    headers.retain(|header| header.lower_name() != "x-forwarded-for");
    headers.push(HeaderLine::new("X-Forwarded-For", value));
}

/// Sets `X-Forwarded-Proto`, replacing any client-supplied value. The proxy
/// listens on plain HTTP, so forwarded requests always carry `"http"`.
pub fn set_forwarded_proto(headers: &mut Vec<HeaderLine>, proto: &str) {
    headers.retain(|header| header.lower_name() != "x-forwarded-proto");
    headers.push(HeaderLine::new("X-Forwarded-Proto", proto));
}

/// The client address without the port.
pub fn client_ip(peer: &SocketAddr) -> String {
    peer.ip().to_string()
}

pub fn first_value<'a>(headers: &'a [HeaderLine], lower_name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.lower_name() == lower_name)
        .map(|header| header.value.as_str())
}

pub fn has_token(headers: &[HeaderLine], lower_name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.lower_name() == lower_name)
        .flat_map(|header| header.value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}
