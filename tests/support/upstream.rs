use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum UpstreamBehavior {
    HttpResponse { response: Arc<Vec<u8>> },
    Echo,
}

/// A scripted origin server: counts requests and records the most recent
/// request head so tests can assert on what the proxy actually sent.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    last_request: Arc<Mutex<String>>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    /// Serves `HTTP/1.1 200 OK` with the given extra header lines and body.
    pub async fn http_ok(extra_headers: &str, body: &str) -> Result<Self> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n",
            body.len()
        );
        for line in extra_headers.lines() {
            if !line.trim().is_empty() {
                response.push_str(line.trim_end());
                response.push_str("\r\n");
            }
        }
        response.push_str("\r\n");
        response.push_str(body);
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into_bytes()),
        })
        .await
    }

    /// Serves a verbatim response.
    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into()),
        })
        .await
    }

    /// Echoes every byte back; used as the far end of CONNECT tunnels.
    pub async fn echo() -> Result<Self> {
        Self::spawn(UpstreamBehavior::Echo).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> String {
        self.last_request.lock().unwrap().clone()
    }

    async fn spawn(behavior: UpstreamBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(Mutex::new(String::new()));

        let accept_requests = requests.clone();
        let accept_last = last_request.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let behavior = behavior.clone();
                let requests = accept_requests.clone();
                let last_request = accept_last.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(&mut stream, behavior, requests, last_request).await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            last_request,
            handle,
        })
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    behavior: UpstreamBehavior,
    requests: Arc<AtomicUsize>,
    last_request: Arc<Mutex<String>>,
) -> Result<()> {
    match behavior {
        UpstreamBehavior::HttpResponse { response } => {
            let head = read_until_double_crlf(stream).await?;
            if head.is_empty() {
                return Ok(());
            }
            requests.fetch_add(1, Ordering::SeqCst);
            *last_request.lock().unwrap() = String::from_utf8_lossy(&head).into_owned();
            drain_request_body(stream, &head).await?;
            stream.write_all(&response).await?;
            stream.shutdown().await.ok();
        }
        UpstreamBehavior::Echo => {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            stream.shutdown().await.ok();
        }
    }
    Ok(())
}

/// Consumes any declared request body so closing the socket cannot race the
/// proxy's body write with a reset.
async fn drain_request_body(stream: &mut TcpStream, head: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(head);
    let content_length = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let header_end = head
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(head.len());
    let already_read = head.len() - header_end;
    let mut remaining = content_length.saturating_sub(already_read);
    let mut buf = [0u8; 1024];
    while remaining > 0 {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
    Ok(())
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    Ok(data)
}
