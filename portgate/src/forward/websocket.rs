//! Raw HTTP/1.1 upgrade handshake against the local listener.
//!
//! The handshake is written by hand so that the socket can be handed back
//! untouched: whatever the listener sends right after the `101` (often the
//! first WebSocket frame) stays in the returned reader's buffer.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{HeaderName, HeaderValue, Method};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::message::{HeaderValues, HttpRequest, HttpResponse};

pub const UPGRADE_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// The upgraded local socket. Reads drain the handshake reader's buffer
/// before touching the socket again.
#[derive(Debug)]
pub struct UpgradedConn {
    inner: BufReader<TcpStream>,
}

impl UpgradedConn {
    /// Bytes received after the response head and not yet read.
    pub fn buffered(&self) -> &[u8] {
        self.inner.buffer()
    }
}

impl AsyncRead for UpgradedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpgradedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Sends `request` verbatim to `local_addr` and reads back the response
/// head. The socket is returned whatever the status; the caller decides
/// whether the upgrade happened. On error the socket is closed.
pub async fn forward_websocket_upgrade(
    local_addr: &str,
    request: &HttpRequest,
) -> Result<(HttpResponse, UpgradedConn)> {
    let head = request_head(local_addr, request)?;

    let mut stream = match tokio::time::timeout(UPGRADE_DIAL_TIMEOUT, TcpStream::connect(local_addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(Error::LocalDial {
                addr: local_addr.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(Error::LocalDial {
                addr: local_addr.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
            });
        }
    };
    let _ = stream.set_nodelay(true);

    stream.write_all(head.as_bytes()).await?;
    if !request.body.is_empty() {
        stream.write_all(&request.body).await?;
    }
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let response = read_response_head(&mut reader).await?;
    debug!(
        "Upgrade {} {} -> {}",
        request.method,
        request.path_and_query(),
        response.status_code
    );
    Ok((response, UpgradedConn { inner: reader }))
}

fn request_head(local_addr: &str, request: &HttpRequest) -> Result<String> {
    let method = if request.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(request.method.as_bytes()).map_err(http::Error::from)?
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", method, request.path_and_query());
    let mut has_host = false;
    let mut has_forwarded_for = false;
    for (name, values) in &request.headers {
        // Rejects names and values that would break the framing.
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
        has_host |= header == http::header::HOST;
        has_forwarded_for |= header.as_str() == "x-forwarded-for";
        for value in &values.values {
            HeaderValue::from_bytes(value.as_bytes()).map_err(http::Error::from)?;
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    if !has_host {
        head.push_str(&format!("Host: {local_addr}\r\n"));
    }
    if !has_forwarded_for && !request.remote_addr.is_empty() {
        HeaderValue::from_bytes(request.remote_addr.as_bytes()).map_err(http::Error::from)?;
        head.push_str(&format!("X-Forwarded-For: {}\r\n", request.remote_addr));
    }
    head.push_str("\r\n");
    Ok(head)
}

/// Reads one line, taking at most one byte more than what is left of the
/// head budget so an endless line is cut off instead of buffered.
async fn read_head_line(
    reader: &mut BufReader<TcpStream>,
    line: &mut String,
    consumed: usize,
) -> Result<usize> {
    let budget = MAX_RESPONSE_HEAD.saturating_sub(consumed) as u64 + 1;
    let n = (&mut *reader).take(budget).read_line(line).await?;
    if consumed + n > MAX_RESPONSE_HEAD {
        return Err(Error::UpgradeResponse("response head too large".into()));
    }
    Ok(n)
}

async fn read_response_head(reader: &mut BufReader<TcpStream>) -> Result<HttpResponse> {
    let mut line = String::new();
    let mut consumed = read_head_line(reader, &mut line, 0).await?;
    if consumed == 0 {
        return Err(Error::UpgradeResponse(
            "connection closed before the status line".into(),
        ));
    }
    let status_code = parse_status_line(line.trim_end())?;

    let mut headers: HashMap<String, HeaderValues> = HashMap::new();
    loop {
        line.clear();
        let n = read_head_line(reader, &mut line, consumed).await?;
        if n == 0 {
            return Err(Error::UpgradeResponse(
                "connection closed inside the response head".into(),
            ));
        }
        consumed += n;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::UpgradeResponse(format!("malformed header line '{line}'")));
        };
        headers
            .entry(name.trim().to_string())
            .or_default()
            .values
            .push(value.trim().to_string());
    }

    Ok(HttpResponse {
        status_code: i32::from(status_code),
        headers,
        body: Default::default(),
    })
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(Error::UpgradeResponse(format!("bad status line '{line}'")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| Error::UpgradeResponse(format!("bad status line '{line}'")))
}
