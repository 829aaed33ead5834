use anyhow::{anyhow, bail, ensure, Context, Result};
use http::header::HeaderName;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::headers::{has_token, HeaderLine};

const COPY_BUFFER: usize = 8192;

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl RequestHead {
    pub fn host(&self) -> Option<&str> {
        super::headers::first_value(&self.headers, "host")
    }

    /// Whether the client connection must close after this exchange.
    pub fn wants_close(&self) -> bool {
        if has_token(&self.headers, "connection", "close") {
            return true;
        }
        self.version == Version::HTTP_10 && !has_token(&self.headers, "connection", "keep-alive")
    }

    pub fn body_plan(&self) -> BodyPlan {
        if self.chunked {
            BodyPlan::Chunked
        } else {
            match self.content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }
}

pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl ResponseHead {
    pub fn body_plan(&self, request_method: &Method) -> BodyPlan {
        if request_method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return BodyPlan::Empty;
        }
        if self.chunked {
            return BodyPlan::Chunked;
        }
        match self.content_length {
            Some(length) => BodyPlan::Fixed(length),
            None => BodyPlan::UntilClose,
        }
    }
}

/// Reads one CRLF-terminated line, enforcing `max_len`. Returns 0 on clean
/// EOF before any byte arrives.
async fn read_line<S>(reader: &mut BufReader<S>, buf: &mut String, max_len: usize) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = reader.fill_buf().await.context("reading line")?;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed mid-line");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

fn parse_version(token: &str) -> Result<Version> {
    match token {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => bail!("unsupported HTTP version '{other}'"),
    }
}

/// Reads and validates a request head. `Ok(None)` means the client closed the
/// connection cleanly between requests.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let request_line_bytes = read_line(reader, &mut request_line, max_header_bytes).await?;
    if request_line_bytes == 0 {
        return Ok(None);
    }
    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line");
    }

    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let version = parse_version(version_str)?;
    let target = target.to_string();

    let mut budget = max_header_bytes
        .checked_sub(request_line_bytes)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let (headers, content_length, chunked) = read_header_block(reader, &mut budget).await?;

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        content_length,
        chunked,
    }))
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let status_line_bytes = read_line(reader, &mut status_line, max_header_bytes).await?;
    if status_line_bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    let trimmed = status_line.trim_end_matches(['\r', '\n']);

    let mut parts = trimmed.split_whitespace();
    let version_str = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status_str = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    parse_version(version_str)
        .with_context(|| format!("unsupported upstream status line '{trimmed}'"))?;
    let status_code: u16 = status_str
        .parse()
        .with_context(|| format!("invalid upstream status code '{status_str}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    let mut budget = max_header_bytes
        .checked_sub(status_line_bytes)
        .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
    let (headers, content_length, chunked) = read_header_block(reader, &mut budget).await?;

    Ok(ResponseHead {
        status,
        reason,
        headers,
        content_length,
        chunked,
    })
}

/// Reads header lines up to the blank separator, returning them in wire order
/// along with the parsed framing headers.
async fn read_header_block<S>(
    reader: &mut BufReader<S>,
    budget: &mut usize,
) -> Result<(Vec<HeaderLine>, Option<u64>, bool)>
where
    S: AsyncRead + Unpin,
{
    let mut headers = Vec::new();
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut line = String::new();

    loop {
        ensure!(*budget > 0, "headers exceed configured limit");
        let read = read_line(reader, &mut line, *budget).await?;
        if read == 0 {
            bail!("connection closed during headers");
        }
        *budget -= read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;

        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }

        headers.push(HeaderLine::new(name, value));
    }

    if chunked && content_length.is_some() {
        bail!("message must not include both Transfer-Encoding and Content-Length");
    }

    Ok((headers, content_length, chunked))
}

/// Encodes the origin-form request we send upstream. Framing headers and
/// `Host` are emitted here; `headers` is expected to be already shaped.
pub fn encode_request_head(
    method: &Method,
    path: &str,
    authority: &str,
    headers: &[HeaderLine],
    body_plan: BodyPlan,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(authority.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for header in headers {
        if matches!(header.lower_name(), "host" | "content-length") {
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if let BodyPlan::Fixed(length) = body_plan {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(length.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    // One upstream connection per request; no pooling.
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

/// Encodes a response head for the client. `headers` must already have the
/// hop-by-hop and `Connection`-listed strip applied; stale `Content-Length`
/// lines are skipped and re-emitted from the body plan.
pub fn encode_response_head(
    status: StatusCode,
    reason: &str,
    headers: &[HeaderLine],
    body_plan: BodyPlan,
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    if !reason.is_empty() {
        buffer.push(b' ');
        buffer.extend_from_slice(reason.as_bytes());
    }
    buffer.extend_from_slice(b"\r\n");

    let mut origin_content_length = None;
    for header in headers {
        if header.lower_name() == "content-length" {
            if origin_content_length.is_none() {
                origin_content_length = Some(header.value.clone());
            }
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match body_plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        BodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        BodyPlan::Empty => {
            // HEAD and 304 responses keep the origin's length claim.
            if let Some(value) = origin_content_length {
                buffer.extend_from_slice(b"Content-Length: ");
                buffer.extend_from_slice(value.as_bytes());
                buffer.extend_from_slice(b"\r\n");
            }
        }
        BodyPlan::UntilClose => {}
    }

    if close || body_plan == BodyPlan::UntilClose {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Writes a proxy-originated error response with an exact text body.
pub async fn write_simple_response<W>(
    writer: &mut W,
    status: StatusCode,
    body: &str,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_str(),
        reason,
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok((head.len() + body.len()) as u64)
}

/// Copies exactly `length` bytes from `reader` to `writer`.
pub async fn copy_fixed<R, W>(reader: &mut R, writer: &mut W, length: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buffer = [0u8; COPY_BUFFER];
    while remaining > 0 {
        let want = remaining.min(COPY_BUFFER as u64) as usize;
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            bail!("connection closed with {remaining} body bytes remaining");
        }
        writer.write_all(&buffer[..read]).await?;
        remaining -= read as u64;
    }
    writer.flush().await?;
    Ok(length)
}

/// Copies from `reader` until EOF, returning the byte count.
pub async fn copy_until_close<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; COPY_BUFFER];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        transferred += read as u64;
    }
    writer.flush().await?;
    Ok(transferred)
}

/// Reads exactly `length` bytes into memory, enforcing `max`.
pub async fn read_fixed<R>(reader: &mut R, length: u64, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    ensure!(
        length <= max as u64,
        "body of {length} bytes exceeds buffer limit of {max} bytes"
    );
    let mut body = vec![0u8; length as usize];
    reader
        .read_exact(&mut body)
        .await
        .context("reading fixed-length body")?;
    Ok(body)
}

/// Copies until EOF while teeing the bytes into memory for a later cache
/// store. The buffer is dropped (second element `None`) once `limit` is
/// exceeded; streaming to the client continues regardless.
pub async fn copy_until_close_tee<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: usize,
) -> Result<(u64, Option<Vec<u8>>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut tee: Option<Vec<u8>> = Some(Vec::new());
    let mut buffer = [0u8; COPY_BUFFER];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        transferred += read as u64;
        if let Some(body) = tee.as_mut() {
            if body.len() + read > limit {
                tee = None;
            } else {
                body.extend_from_slice(&buffer[..read]);
            }
        }
    }
    writer.flush().await?;
    Ok((transferred, tee))
}

async fn read_chunk_size<S>(reader: &mut BufReader<S>) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line(reader, &mut line, 1024).await?;
    if read == 0 {
        bail!("connection closed before chunk size");
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_token = trimmed.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_token, 16)
        .with_context(|| format!("invalid chunk size '{size_token}'"))
}

async fn read_chunk_terminator<S>(reader: &mut BufReader<S>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .context("reading chunk terminator")?;
    ensure!(&crlf == b"\r\n", "chunk data not terminated by CRLF");
    Ok(())
}

/// Consumes (and discards) the trailer section after the final chunk.
async fn discard_trailers<S>(reader: &mut BufReader<S>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        let read = read_line(reader, &mut line, 8 * 1024).await?;
        if read == 0 {
            bail!("connection closed during trailers");
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            return Ok(());
        }
    }
}

/// Decodes a whole chunked body into memory, enforcing `max`. Trailers are
/// consumed and dropped; they are hop-bound metadata the proxy never forwards.
pub async fn read_chunked_body<S>(reader: &mut BufReader<S>, max: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            discard_trailers(reader).await?;
            return Ok(body);
        }
        ensure!(
            body.len() as u64 + size <= max as u64,
            "chunked body exceeds buffer limit of {max} bytes"
        );
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .context("reading chunk data")?;
        read_chunk_terminator(reader).await?;
    }
}

/// Streams a chunked body through, re-encoding each chunk for the client.
/// Returns the decoded payload size.
pub async fn stream_chunked<S, W>(reader: &mut BufReader<S>, writer: &mut W) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut chunk = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            discard_trailers(reader).await?;
            writer.write_all(b"0\r\n\r\n").await?;
            writer.flush().await?;
            return Ok(transferred);
        }
        chunk.resize(size as usize, 0);
        reader
            .read_exact(&mut chunk)
            .await
            .context("reading chunk data")?;
        read_chunk_terminator(reader).await?;

        writer
            .write_all(format!("{size:x}\r\n").as_bytes())
            .await?;
        writer.write_all(&chunk).await?;
        writer.write_all(b"\r\n").await?;
        transferred += size;
    }
}

/// Chunked variant of the tee copy: decoded payload goes to the buffer, the
/// re-encoded chunks go to the client.
pub async fn stream_chunked_tee<S, W>(
    reader: &mut BufReader<S>,
    writer: &mut W,
    limit: usize,
) -> Result<(u64, Option<Vec<u8>>)>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut tee: Option<Vec<u8>> = Some(Vec::new());
    let mut chunk = Vec::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            discard_trailers(reader).await?;
            writer.write_all(b"0\r\n\r\n").await?;
            writer.flush().await?;
            return Ok((transferred, tee));
        }
        chunk.resize(size as usize, 0);
        reader
            .read_exact(&mut chunk)
            .await
            .context("reading chunk data")?;
        read_chunk_terminator(reader).await?;

        writer
            .write_all(format!("{size:x}\r\n").as_bytes())
            .await?;
        writer.write_all(&chunk).await?;
        writer.write_all(b"\r\n").await?;
        transferred += size;
        if let Some(body) = tee.as_mut() {
            if body.len() + chunk.len() > limit {
                tee = None;
            } else {
                body.extend_from_slice(&chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_request_head_in_order() -> Result<()> {
        let raw = b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\nAccept: text/html\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, 1024).await?.expect("head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.test/");
        assert_eq!(head.version, Version::HTTP_11);
        let names: Vec<_> = head.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Host", "Accept", "Accept"]);
        assert_eq!(head.headers[1].value, "*/*");
        assert_eq!(head.headers[2].value, "text/html");
        assert!(!head.wants_close());
        Ok(())
    }

    #[tokio::test]
    async fn clean_eof_returns_none() -> Result<()> {
        let raw: &[u8] = b"";
        let mut reader = BufReader::new(raw);
        assert!(read_request_head(&mut reader, 1024).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn http10_defaults_to_close() -> Result<()> {
        let raw = b"GET http://example.test/ HTTP/1.0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader, 1024).await?.expect("head");
        assert!(head.wants_close());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_conflicting_framing_headers() {
        let raw =
            b"POST http://example.test/ HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request_head(&mut reader, 1024).await.unwrap_err();
        assert!(
            err.to_string().contains("must not include both"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn rejects_oversized_headers() {
        let raw = b"GET http://example.test/ HTTP/1.1\r\nX-Big: aaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request_head(&mut reader, 48).await.unwrap_err();
        assert!(
            err.to_string().contains("limit"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn reads_response_head() -> Result<()> {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader, 1024).await?;
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.reason, "Not Found");
        assert_eq!(head.content_length, Some(9));
        assert_eq!(head.body_plan(&Method::GET), BodyPlan::Fixed(9));
        assert_eq!(head.body_plan(&Method::HEAD), BodyPlan::Empty);
        Ok(())
    }

    #[tokio::test]
    async fn response_without_length_reads_until_close() -> Result<()> {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nrest";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader, 1024).await?;
        assert_eq!(head.body_plan(&Method::GET), BodyPlan::UntilClose);
        Ok(())
    }

    #[tokio::test]
    async fn decodes_chunked_body() -> Result<()> {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let body = read_chunked_body(&mut reader, 1024).await?;
        assert_eq!(body, b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn chunked_body_respects_limit() {
        let raw = b"5\r\nhello\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_chunked_body(&mut reader, 3).await.unwrap_err();
        assert!(
            err.to_string().contains("buffer limit"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn streams_chunked_body_verbatim() -> Result<()> {
        let raw = b"3\r\nabc\r\n2\r\nde\r\n0\r\nX-Trailer: ignored\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Vec::new();
        let transferred = stream_chunked(&mut reader, &mut out).await?;
        assert_eq!(transferred, 5);
        assert_eq!(out, b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn until_close_tee_buffers_within_limit() -> Result<()> {
        let data = b"stream me";
        let mut reader = &data[..];
        let mut out = Vec::new();
        let (transferred, tee) = copy_until_close_tee(&mut reader, &mut out, 1024).await?;
        assert_eq!(transferred, 9);
        assert_eq!(out, b"stream me");
        assert_eq!(tee.as_deref(), Some(&b"stream me"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn until_close_tee_discards_buffer_over_limit() -> Result<()> {
        let data = b"stream me";
        let mut reader = &data[..];
        let mut out = Vec::new();
        let (transferred, tee) = copy_until_close_tee(&mut reader, &mut out, 4).await?;
        assert_eq!(transferred, 9);
        assert_eq!(out, b"stream me", "client still receives the full body");
        assert!(tee.is_none(), "oversized body skips the cache buffer");
        Ok(())
    }

    #[tokio::test]
    async fn chunked_tee_returns_decoded_body() -> Result<()> {
        let raw = b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Vec::new();
        let (transferred, tee) = stream_chunked_tee(&mut reader, &mut out, 1024).await?;
        assert_eq!(transferred, 5);
        assert_eq!(tee.as_deref(), Some(&b"abcde"[..]));
        assert_eq!(out, b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
        Ok(())
    }

    #[test]
    fn request_encoding_is_origin_form() {
        let headers = vec![
            HeaderLine::new("Accept", "*/*"),
            HeaderLine::new("Host", "stale.example"),
            HeaderLine::new("X-Forwarded-For", "10.0.0.1"),
        ];
        let encoded = encode_request_head(
            &Method::GET,
            "/path?x=1",
            "example.test:8080",
            &headers,
            BodyPlan::Empty,
        );
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.test:8080\r\n"));
        assert!(!text.contains("stale.example"));
        assert!(text.contains("X-Forwarded-For: 10.0.0.1\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn response_encoding_rewrites_content_length() {
        let headers = vec![
            HeaderLine::new("Content-Length", "999"),
            HeaderLine::new("Content-Type", "text/plain"),
        ];
        let encoded =
            encode_response_head(StatusCode::OK, "OK", &headers, BodyPlan::Fixed(5), false);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.contains("Connection"));
    }

    #[test]
    fn until_close_response_forces_connection_close() {
        let encoded = encode_response_head(StatusCode::OK, "OK", &[], BodyPlan::UntilClose, false);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn empty_plan_keeps_origin_length_claim() {
        let headers = vec![HeaderLine::new("Content-Length", "42")];
        let encoded = encode_response_head(StatusCode::OK, "OK", &headers, BodyPlan::Empty, true);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn simple_response_has_exact_body() -> Result<()> {
        let mut out = Vec::new();
        write_simple_response(&mut out, StatusCode::FORBIDDEN, "Forbidden Content").await?;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Length: 17\r\n"));
        assert!(text.ends_with("\r\n\r\nForbidden Content"));
        Ok(())
    }

    #[tokio::test]
    async fn copy_fixed_transfers_exact_count() -> Result<()> {
        let data = b"hello world";
        let mut reader = &data[..];
        let mut out = Vec::new();
        let copied = copy_fixed(&mut reader, &mut out, 5).await?;
        assert_eq!(copied, 5);
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn copy_fixed_errors_on_short_read() {
        let data = b"abc";
        let mut reader = &data[..];
        let mut out = Vec::new();
        let err = copy_fixed(&mut reader, &mut out, 10).await.unwrap_err();
        assert!(
            err.to_string().contains("body bytes remaining"),
            "unexpected error: {err:?}"
        );
    }
}
