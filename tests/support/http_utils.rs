use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Sends a raw request and reads the whole response until the proxy closes
/// the connection. Requests should carry `Connection: close`.
pub async fn send_request(addr: SocketAddr, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// A proxied GET for `url` with optional extra header lines.
pub fn proxy_get(url: &str, host: &str, extra_headers: &str) -> String {
    let mut request = format!("GET {url} HTTP/1.1\r\nHost: {host}\r\n");
    for line in extra_headers.lines() {
        if !line.trim().is_empty() {
            request.push_str(line.trim_end());
            request.push_str("\r\n");
        }
    }
    request.push_str("Connection: close\r\n\r\n");
    request
}
