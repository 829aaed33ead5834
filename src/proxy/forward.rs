use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::cache::{LAST_MODIFIED_ABSENT, MAX_AGE_UNKNOWN};
use super::codec::{
    copy_fixed, copy_until_close, copy_until_close_tee, encode_request_head,
    encode_response_head, read_chunked_body, read_fixed, read_response_head, stream_chunked,
    stream_chunked_tee, BodyPlan, RequestHead,
};
use super::headers::{
    append_forwarded_for, client_ip, first_value, has_token, sanitize_forwarded,
    set_forwarded_proto, HeaderLine,
};
use super::request::ParsedRequest;
use super::AppContext;

/// What happened to the cache on this exchange, for the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CacheStore {
    Stored,
    Skipped,
    Bypassed,
}

impl CacheStore {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStore::Stored => "stored",
            CacheStore::Skipped => "skipped",
            CacheStore::Bypassed => "bypass",
        }
    }
}

pub(super) struct ForwardOutcome {
    pub status: StatusCode,
    pub bytes_out: u64,
    pub close: bool,
    pub cache_store: CacheStore,
}

/// The freshness directives the proxy admits into the cache: a response is
/// stored iff `Cache-Control` names `public`, `no-cache`, or `max-age=`.
/// An absent or unparsable `max-age` is stored with the "unknown" lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct CachePolicy {
    pub cacheable: bool,
    pub max_age: i64,
}

pub(super) fn cache_policy(headers: &[HeaderLine]) -> CachePolicy {
    let mut cacheable = false;
    let mut max_age = MAX_AGE_UNKNOWN;

    for header in headers {
        if header.lower_name() != "cache-control" {
            continue;
        }
        for directive in header.value.split(',') {
            let directive = directive.trim();
            if directive.eq_ignore_ascii_case("public") || directive.eq_ignore_ascii_case("no-cache")
            {
                cacheable = true;
                continue;
            }
            let lower = directive.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix("max-age=") {
                cacheable = true;
                if let Ok(seconds) = value.trim().parse::<i64>() {
                    max_age = seconds;
                }
            }
        }
    }

    CachePolicy { cacheable, max_age }
}

/// Forwards one non-CONNECT request to its origin and writes the response to
/// the client, teeing cacheable GET bodies into the cache. Errors before any
/// response byte reaches the client are reported by the caller as `500`.
pub(super) async fn forward_request<S>(
    client: &mut BufReader<S>,
    parsed: &ParsedRequest,
    head: &RequestHead,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<ForwardOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Shape the outbound header set: forwarding metadata first, then the
    // hop-by-hop discipline.
    let mut outbound = head.headers.clone();
    set_forwarded_proto(&mut outbound, "http");
    append_forwarded_for(&mut outbound, &client_ip(&peer));
    sanitize_forwarded(&mut outbound);

    // A client waiting on Expect: 100-continue will not send its body until
    // it sees the interim response.
    let request_plan = head.body_plan();
    if request_plan != BodyPlan::Empty && has_token(&head.headers, "expect", "100-continue") {
        let writer = client.get_mut();
        writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        writer.flush().await?;
    }

    // Chunked request bodies are decoded up front and re-sent with a known
    // length; fixed-length bodies stream through after the head.
    let buffered_request_body = match request_plan {
        BodyPlan::Chunked => {
            Some(read_chunked_body(client, app.settings.max_body_buffer).await?)
        }
        _ => None,
    };

    let origin = timeout(
        app.settings.dial_timeout(),
        TcpStream::connect((parsed.host.as_str(), parsed.port)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connection to {}:{} timed out", parsed.host, parsed.port))?
    .with_context(|| format!("failed to connect to {}:{}", parsed.host, parsed.port))?;
    if let Err(err) = origin.set_nodelay(true) {
        debug!(host = %parsed.host, error = %err, "failed to set TCP_NODELAY on origin stream");
    }
    let mut origin = BufReader::new(origin);

    let outbound_plan = match (&buffered_request_body, request_plan) {
        (Some(body), _) => BodyPlan::Fixed(body.len() as u64),
        (None, plan) => plan,
    };
    let request_head = encode_request_head(
        &head.method,
        &parsed.path,
        &parsed.authority(),
        &outbound,
        outbound_plan,
    );
    origin
        .get_mut()
        .write_all(&request_head)
        .await
        .context("writing request to origin")?;
    match (buffered_request_body, request_plan) {
        (Some(body), _) => {
            origin
                .get_mut()
                .write_all(&body)
                .await
                .context("writing buffered request body to origin")?;
        }
        (None, BodyPlan::Fixed(length)) => {
            copy_fixed(client, origin.get_mut(), length)
                .await
                .context("forwarding request body to origin")?;
        }
        _ => {}
    }
    origin
        .get_mut()
        .flush()
        .await
        .context("flushing request to origin")?;

    // Skip interim 1xx responses; the next head is the real one. 101 cannot
    // happen because Upgrade never survives the hop-by-hop strip.
    let mut response = read_response_head(&mut origin, app.settings.max_header_size).await?;
    while response.status.is_informational()
        && response.status != StatusCode::SWITCHING_PROTOCOLS
    {
        response = read_response_head(&mut origin, app.settings.max_header_size).await?;
    }

    let policy = if head.method == Method::GET {
        cache_policy(&response.headers)
    } else {
        CachePolicy {
            cacheable: false,
            max_age: MAX_AGE_UNKNOWN,
        }
    };
    let last_modified = first_value(&response.headers, "last-modified")
        .filter(|value| !value.is_empty())
        .unwrap_or(LAST_MODIFIED_ABSENT)
        .to_string();

    // Headers stored in the cache are the origin's, as received; the strip
    // discipline is applied on the way out (both here and on later hits).
    let stored_headers = response.headers.clone();
    let mut client_headers = response.headers.clone();
    sanitize_forwarded(&mut client_headers);

    let response_plan = response.body_plan(&head.method);
    let close = head.wants_close() || response_plan == BodyPlan::UntilClose;
    let mut cache_store = if policy.cacheable {
        CacheStore::Skipped
    } else {
        CacheStore::Bypassed
    };

    let writer = client.get_mut();
    let mut bytes_out;
    match response_plan {
        BodyPlan::Empty => {
            let head_bytes = encode_response_head(
                response.status,
                &response.reason,
                &client_headers,
                BodyPlan::Empty,
                close,
            );
            writer.write_all(&head_bytes).await?;
            writer.flush().await?;
            bytes_out = head_bytes.len() as u64;
        }
        BodyPlan::Fixed(length) => {
            if policy.cacheable && length <= app.settings.max_body_buffer as u64 {
                // Buffer the whole body once; the same bytes feed the cache
                // and the client.
                let body = read_fixed(&mut origin, length, app.settings.max_body_buffer).await?;
                let head_bytes = encode_response_head(
                    response.status,
                    &response.reason,
                    &client_headers,
                    BodyPlan::Fixed(body.len() as u64),
                    close,
                );
                writer.write_all(&head_bytes).await?;
                writer.write_all(&body).await?;
                writer.flush().await?;
                bytes_out = head_bytes.len() as u64 + body.len() as u64;
                app.cache
                    .put(
                        &parsed.url,
                        response.status,
                        &stored_headers,
                        body,
                        policy.max_age,
                        last_modified,
                    )
                    .await;
                cache_store = CacheStore::Stored;
            } else {
                let head_bytes = encode_response_head(
                    response.status,
                    &response.reason,
                    &client_headers,
                    BodyPlan::Fixed(length),
                    close,
                );
                writer.write_all(&head_bytes).await?;
                bytes_out = head_bytes.len() as u64;
                bytes_out += copy_fixed(&mut origin, writer, length).await?;
            }
        }
        BodyPlan::Chunked => {
            let head_bytes = encode_response_head(
                response.status,
                &response.reason,
                &client_headers,
                BodyPlan::Chunked,
                close,
            );
            writer.write_all(&head_bytes).await?;
            bytes_out = head_bytes.len() as u64;
            if policy.cacheable {
                let (transferred, tee) =
                    stream_chunked_tee(&mut origin, writer, app.settings.max_body_buffer).await?;
                bytes_out += transferred;
                if let Some(body) = tee {
                    app.cache
                        .put(
                            &parsed.url,
                            response.status,
                            &stored_headers,
                            body,
                            policy.max_age,
                            last_modified,
                        )
                        .await;
                    cache_store = CacheStore::Stored;
                }
            } else {
                bytes_out += stream_chunked(&mut origin, writer).await?;
            }
        }
        BodyPlan::UntilClose => {
            let head_bytes = encode_response_head(
                response.status,
                &response.reason,
                &client_headers,
                BodyPlan::UntilClose,
                close,
            );
            writer.write_all(&head_bytes).await?;
            bytes_out = head_bytes.len() as u64;
            if policy.cacheable {
                let (transferred, tee) =
                    copy_until_close_tee(&mut origin, writer, app.settings.max_body_buffer)
                        .await?;
                bytes_out += transferred;
                if let Some(body) = tee {
                    app.cache
                        .put(
                            &parsed.url,
                            response.status,
                            &stored_headers,
                            body,
                            policy.max_age,
                            last_modified,
                        )
                        .await;
                    cache_store = CacheStore::Stored;
                }
            } else {
                bytes_out += copy_until_close(&mut origin, writer).await?;
            }
        }
    }

    origin.get_mut().shutdown().await.ok();

    Ok(ForwardOutcome {
        status: response.status,
        bytes_out,
        close,
        cache_store,
    })
}
