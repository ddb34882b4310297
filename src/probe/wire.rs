//! Minimal HTTP/1.1 plumbing shared by the probers: request formatting,
//! bounded response-head parsing, bounded body reads and the CONNECT
//! tunnel handshake. No pooling, no HTTP/2, no compression.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::dial::{Conn, Deadline};
use crate::endpoint::Credential;
use crate::ipinfo::USER_AGENT;

/// Cap on status line + header block.
pub const MAX_HEADER_BYTES: usize = 4 * 1024;

/// Read/write chunk size.
pub const IO_BUF_BYTES: usize = 4 * 1024;

/// Parsed response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub status_line: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead> {
    let text = std::str::from_utf8(raw).unwrap_or_default();
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default().trim().to_string();
    let upper = status_line.to_ascii_uppercase();
    if !upper.starts_with("HTTP/1.1") && !upper.starts_with("HTTP/1.0") {
        bail!("malformed status line {status_line:?}");
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());
    let Some(status) = status else {
        bail!("malformed status line {status_line:?}");
    };
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    Ok(ResponseHead {
        status,
        status_line,
        headers,
    })
}

/// Read a response head, stopping at the blank line. Returns any body bytes
/// that arrived in the same read so callers can hand them to the body
/// reader (or keep them in front of a tunnel).
pub async fn read_response_head<S: Conn>(
    stream: &mut S,
    deadline: &Deadline,
) -> Result<(ResponseHead, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; IO_BUF_BYTES];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((parse_head(&buf)?, leftover));
        }
        if buf.len() >= MAX_HEADER_BYTES {
            bail!("response header block exceeds {MAX_HEADER_BYTES} bytes");
        }
        let room = (MAX_HEADER_BYTES - buf.len()).min(chunk.len());
        let n = deadline
            .io("read response header", stream.read(&mut chunk[..room]))
            .await?;
        if n == 0 {
            bail!("unexpected eof while reading response header");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read at most `cap` body bytes, honoring Content-Length when present.
pub async fn read_body<S: Conn>(
    stream: &mut S,
    mut leftover: Vec<u8>,
    content_length: Option<usize>,
    cap: usize,
    deadline: &Deadline,
) -> Result<Vec<u8>> {
    let want = content_length.map(|l| l.min(cap)).unwrap_or(cap);
    leftover.truncate(want);
    let mut body = leftover;
    let mut chunk = [0u8; IO_BUF_BYTES];
    while body.len() < want {
        let room = (want - body.len()).min(chunk.len());
        let n = deadline
            .io("read response body", stream.read(&mut chunk[..room]))
            .await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(want);
    Ok(body)
}

/// Issue `CONNECT target:port` on an established proxy connection and
/// return the stream once the proxy answers 200. Any bytes the proxy sent
/// after its header block stay readable through the returned wrapper.
pub async fn connect_through<S: Conn>(
    mut stream: S,
    target_host: &str,
    target_port: u16,
    cred: Option<&Credential>,
    deadline: &Deadline,
) -> Result<Prefixed<S>> {
    let target = if target_host.contains(':') {
        format!("[{target_host}]:{target_port}")
    } else {
        format!("{target_host}:{target_port}")
    };
    let mut req = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {USER_AGENT}\r\n"
    );
    if let Some(cred) = cred.filter(|c| !c.is_empty()) {
        req.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            cred.basic_token()
        ));
    }
    req.push_str("\r\n");

    deadline
        .io("write connect request", stream.write_all(req.as_bytes()))
        .await?;
    let (head, leftover) = read_response_head(&mut stream, deadline).await?;
    if head.status != 200 {
        bail!("proxy CONNECT failed: {}", head.status_line);
    }
    Ok(Prefixed::new(leftover, stream))
}

/// Stream with a few already-read bytes stitched back in front.
#[derive(Debug)]
pub struct Prefixed<S> {
    buf: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(buf: Vec<u8>, inner: S) -> Self {
        Self { buf, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
