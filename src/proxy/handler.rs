use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::logging::AccessLogBuilder;

use super::codec::{
    encode_response_head, read_request_head, write_simple_response, BodyPlan, RequestHead,
};
use super::forward::forward_request;
use super::headers::sanitize_forwarded;
use super::request::{parse_connect_target, parse_request_target, ParsedRequest};
use super::{tunnel, AppContext};

enum ClientDisposition {
    Continue,
    Close,
}

/// Serves one client connection: a keep-alive loop of request heads, each run
/// through the staged pipeline. CONNECT leaves the loop entirely, handing the
/// raw stream to the tunnel.
pub(super) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
) -> Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_request_head(&mut reader, app.settings.max_header_size).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "invalid request");
                write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "invalid request")
                    .await
                    .ok();
                break;
            }
        };

        info!(
            peer = %peer,
            method = %head.method,
            target = %head.target,
            host = head.host().unwrap_or(""),
            "request received"
        );

        if head.method == Method::CONNECT {
            handle_connect_request(reader, head, peer, start, &app).await?;
            return Ok(());
        }

        match handle_request(&mut reader, head, peer, start, &app).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    reader.get_mut().shutdown().await.ok();
    Ok(())
}

/// CONNECT: blocking check against the tunnel target's hostname, then hand
/// the stream to the pump. The request consumes the connection either way.
async fn handle_connect_request(
    mut reader: BufReader<TcpStream>,
    head: RequestHead,
    peer: SocketAddr,
    start: Instant,
    app: &AppContext,
) -> Result<()> {
    let target = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(err) => {
            debug!(peer = %peer, target = %head.target, error = %err, "invalid CONNECT target");
            write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "invalid request")
                .await?;
            AccessLogBuilder::for_connect(peer, head.target.clone())
                .status(StatusCode::BAD_REQUEST)
                .decision("ERROR")
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };

    if app.blocklist.is_blocked(&target.host) {
        info!(peer = %peer, host = %target.host, "blocked CONNECT target");
        write_simple_response(
            reader.get_mut(),
            StatusCode::FORBIDDEN,
            "Forbidden Content",
        )
        .await?;
        AccessLogBuilder::for_connect(peer, target.address())
            .status(StatusCode::FORBIDDEN)
            .decision("BLOCKED")
            .elapsed(start.elapsed())
            .log();
        return Ok(());
    }

    tunnel::handle_connect(reader, peer, target, app).await
}

async fn handle_request(
    reader: &mut BufReader<TcpStream>,
    head: RequestHead,
    peer: SocketAddr,
    start: Instant,
    app: &AppContext,
) -> Result<ClientDisposition> {
    let parsed = match parse_request_target(head.method.clone(), &head.target, head.host()) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(peer = %peer, target = %head.target, error = %err, "unparsable request target");
            write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, "invalid request")
                .await?;
            access_log(&parsed_placeholder(&head), peer)
                .status(StatusCode::BAD_REQUEST)
                .decision("ERROR")
                .elapsed(start.elapsed())
                .log();
            return Ok(ClientDisposition::Close);
        }
    };

    if app.blocklist.is_blocked(&parsed.host) {
        info!(peer = %peer, host = %parsed.host, "blocked host");
        let bytes = write_simple_response(
            reader.get_mut(),
            StatusCode::FORBIDDEN,
            "Forbidden Content",
        )
        .await?;
        access_log(&parsed, peer)
            .status(StatusCode::FORBIDDEN)
            .decision("BLOCKED")
            .bytes(0, bytes)
            .elapsed(start.elapsed())
            .log();
        return Ok(ClientDisposition::Close);
    }

    if parsed.scheme.as_deref() != Some("http") {
        let scheme = parsed.scheme.as_deref().unwrap_or("");
        let message = format!("unsupported protocol scheme {scheme}");
        debug!(peer = %peer, target = %head.target, "{message}");
        write_simple_response(reader.get_mut(), StatusCode::BAD_REQUEST, &message).await?;
        access_log(&parsed, peer)
            .status(StatusCode::BAD_REQUEST)
            .decision("ERROR")
            .elapsed(start.elapsed())
            .log();
        return Ok(ClientDisposition::Close);
    }

    if head.method == Method::GET {
        if let Some(hit) = app.cache.get(&parsed.url).await {
            let close = head.wants_close();
            let bytes = serve_cached(reader, &hit, close).await?;
            access_log(&parsed, peer)
                .status(hit.status)
                .decision("CACHE_HIT")
                .bytes(0, bytes)
                .elapsed(start.elapsed())
                .log();
            return Ok(if close {
                ClientDisposition::Close
            } else {
                ClientDisposition::Continue
            });
        }
    }

    match forward_request(reader, &parsed, &head, peer, app).await {
        Ok(outcome) => {
            access_log(&parsed, peer)
                .status(outcome.status)
                .decision("FORWARDED")
                .cache(outcome.cache_store.as_str())
                .bytes(0, outcome.bytes_out)
                .elapsed(start.elapsed())
                .log();
            Ok(if outcome.close {
                ClientDisposition::Close
            } else {
                ClientDisposition::Continue
            })
        }
        Err(err) => {
            warn!(peer = %peer, url = %parsed.url, error = %err, "upstream request failed");
            write_simple_response(
                reader.get_mut(),
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server Error",
            )
            .await
            .ok();
            access_log(&parsed, peer)
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .decision("ERROR")
                .elapsed(start.elapsed())
                .log();
            Ok(ClientDisposition::Close)
        }
    }
}

async fn serve_cached(
    reader: &mut BufReader<TcpStream>,
    hit: &super::cache::CachedResponse,
    close: bool,
) -> Result<u64> {
    let mut headers = hit.headers.clone();
    sanitize_forwarded(&mut headers);
    let reason = hit.status.canonical_reason().unwrap_or("");
    let head_bytes = encode_response_head(
        hit.status,
        reason,
        &headers,
        BodyPlan::Fixed(hit.body.len() as u64),
        close,
    );
    let writer = reader.get_mut();
    writer.write_all(&head_bytes).await?;
    writer.write_all(&hit.body).await?;
    writer.flush().await?;
    Ok(head_bytes.len() as u64 + hit.body.len() as u64)
}

fn access_log(parsed: &ParsedRequest, peer: SocketAddr) -> AccessLogBuilder {
    AccessLogBuilder::new(peer)
        .method(parsed.method.as_str())
        .scheme(parsed.scheme.clone().unwrap_or_default())
        .host(parsed.host.clone())
        .path(parsed.path.clone())
}

fn parsed_placeholder(head: &RequestHead) -> ParsedRequest {
    ParsedRequest {
        method: head.method.clone(),
        scheme: None,
        host: head.host().unwrap_or("").to_string(),
        port: 0,
        path: head.target.clone(),
        url: head.target.clone(),
    }
}
