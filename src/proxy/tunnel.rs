use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::logging::AccessLogBuilder;

use super::codec::write_simple_response;
use super::request::ConnectTarget;
use super::AppContext;

/// Handles a `CONNECT` request. The hand-rolled codec means the handler
/// already owns the raw client stream, so "hijacking" is simply taking the
/// `BufReader` apart; bytes the client pipelined behind the request head are
/// replayed to the origin before the relay starts.
pub(super) async fn handle_connect(
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
    target: ConnectTarget,
    app: &AppContext,
) -> Result<()> {
    let start = Instant::now();
    let address = target.address();
    let log = AccessLogBuilder::for_connect(peer, address.clone());

    let origin = match timeout(
        app.settings.dial_timeout(),
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let mut client = reader.into_inner();
            write_simple_response(
                &mut client,
                StatusCode::SERVICE_UNAVAILABLE,
                &err.to_string(),
            )
            .await?;
            log.status(StatusCode::SERVICE_UNAVAILABLE)
                .decision("ERROR")
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
        Err(_) => {
            let message = format!("connection to {address} timed out");
            let mut client = reader.into_inner();
            write_simple_response(&mut client, StatusCode::SERVICE_UNAVAILABLE, &message).await?;
            log.status(StatusCode::SERVICE_UNAVAILABLE)
                .decision("ERROR")
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };
    if let Err(err) = origin.set_nodelay(true) {
        debug!(target = %address, error = %err, "failed to set TCP_NODELAY on origin stream");
    }

    let early_data = reader.buffer().to_vec();
    let mut client = reader.into_inner();
    let mut origin = origin;

    client
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
        .await
        .context("writing CONNECT response")?;
    client.flush().await.context("flushing CONNECT response")?;
    if !early_data.is_empty() {
        origin
            .write_all(&early_data)
            .await
            .context("replaying buffered client bytes to origin")?;
    }

    let idle_timeout = app.settings.tunnel_idle_timeout();
    let (client_bytes, origin_bytes) = relay(&mut client, &mut origin, idle_timeout).await;

    client.shutdown().await.ok();
    origin.shutdown().await.ok();

    log.status(StatusCode::OK)
        .decision("TUNNELED")
        .bytes(client_bytes, origin_bytes)
        .elapsed(start.elapsed())
        .log();
    Ok(())
}

/// Runs both copy directions concurrently and waits for both to observe
/// termination before returning, so the caller never reuses or closes the
/// streams while a pump is active.
async fn relay(
    client: &mut TcpStream,
    origin: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> (u64, u64) {
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut origin_reader, mut origin_writer) = io::split(origin);

    let client_to_origin = pump(
        &mut client_reader,
        &mut origin_writer,
        idle_timeout,
        "client",
        "origin",
    );
    let origin_to_client = pump(
        &mut origin_reader,
        &mut client_writer,
        idle_timeout,
        "origin",
        "client",
    );

    tokio::join!(client_to_origin, origin_to_client)
}

/// One tunnel direction. EOF and errors both shut down the write side so the
/// reciprocal pump observes EOF and the tunnel winds down promptly; the
/// surrounding shutdowns are idempotent.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    read_label: &str,
    write_label: &str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = match read_with_idle_timeout(reader, &mut buffer, idle_timeout).await {
            Ok(read) => read,
            Err(err) => {
                debug!(from = read_label, error = %err, "tunnel read ended");
                break;
            }
        };
        if read == 0 {
            break;
        }
        if let Err(err) = writer.write_all(&buffer[..read]).await {
            debug!(to = write_label, error = %err, "tunnel write ended");
            break;
        }
        transferred = transferred.saturating_add(read as u64);
    }
    writer.shutdown().await.ok();
    transferred
}

async fn read_with_idle_timeout<R>(
    reader: &mut R,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(duration) => timeout(duration, reader.read(buffer))
            .await
            .context("tunnel read idle timeout")?
            .context("tunnel read failed"),
        None => reader.read(buffer).await.context("tunnel read failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_forwards_bytes_and_shuts_down_writer() {
        let (mut source, source_peer) = tokio::io::duplex(64);
        let (sink, mut sink_peer) = tokio::io::duplex(64);

        let writer_task = tokio::spawn(async move {
            source.write_all(b"tunnel payload").await.unwrap();
            source.shutdown().await.unwrap();
        });

        let (mut reader, _unused_writer) = io::split(source_peer);
        let (_unused_reader, mut writer) = io::split(sink);
        let transferred = pump(&mut reader, &mut writer, None, "client", "origin").await;
        assert_eq!(transferred, 14);

        let mut received = Vec::new();
        sink_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"tunnel payload");
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn pump_idle_timeout_terminates_direction() {
        let (_source_keepalive, source_peer) = tokio::io::duplex(64);
        let (sink, _sink_peer) = tokio::io::duplex(64);

        let (mut reader, _unused_writer) = io::split(source_peer);
        let (_unused_reader, mut writer) = io::split(sink);
        let transferred = pump(
            &mut reader,
            &mut writer,
            Some(Duration::from_millis(20)),
            "client",
            "origin",
        )
        .await;
        assert_eq!(transferred, 0);
    }
}
