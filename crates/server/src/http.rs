//! Plain-HTTP front end: reads requests, answers probes, upgrades to
//! WebSocket.
//!
//! One task per accepted socket. Ordinary requests get a small text
//! response (`200` for `/`, `404` otherwise) and the connection stays open
//! per keep-alive rules. A WebSocket upgrade request ends the HTTP phase:
//! the `101` response is written and the socket is handed to
//! [`session::spawn`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::registry::Server;
use crate::session;

/// Limit on the request line + headers of one request.
const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Limit on a request body; anything larger closes the connection.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Value of the `Server` response header.
pub const SERVER_IDENT: &str = concat!("lasertag-server/", env!("CARGO_PKG_VERSION"));

const PROBE_BODY: &str = "lasertag server\r\n";
const BAD_REQUEST_BODY: &str = "<html><body><h1>400 Bad Request</h1></body></html>";

/// One parsed HTTP request.
#[derive(Debug)]
struct Request {
    method: String,
    target: String,
    /// `true` for HTTP/1.1, `false` for HTTP/1.0.
    version_11: bool,
    /// Header names are lowercased at parse time.
    headers: Vec<(String, String)>,
    content_length: usize,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn keep_alive(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        if self.version_11 {
            !token_list_contains(connection, "close")
        } else {
            token_list_contains(connection, "keep-alive")
        }
    }

    fn wants_upgrade(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        let upgrade = self.header("upgrade").unwrap_or("");
        token_list_contains(connection, "upgrade") && upgrade.eq_ignore_ascii_case("websocket")
    }
}

fn token_list_contains(list: &str, token: &str) -> bool {
    list.split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Result of reading one request off the socket.
enum ReadOutcome {
    Request(Request),
    /// Peer closed (or half-closed) before a complete request arrived.
    Eof,
    /// Header or body exceeded its limit; close without a response.
    TooLarge,
    /// Ill-formed request; answer `400 Bad Request`.
    Malformed,
    /// Transport error; drop the connection.
    Io,
}

/// Serves one connection until it closes or upgrades.
pub async fn run(mut stream: TcpStream, remote: SocketAddr, server: Arc<Server>) {
    let mut buf = Vec::new();
    loop {
        match read_request(&mut stream, &mut buf).await {
            ReadOutcome::Request(request) => {
                tracing::debug!(%remote, method = %request.method, target = %request.target, "request");
                if request.wants_upgrade() {
                    if !buf.is_empty() {
                        // Frames sent before the 101 went out cannot be
                        // replayed into the WebSocket stream.
                        tracing::warn!(%remote, "discarding bytes pipelined before upgrade");
                    }
                    match upgrade(stream, &request).await {
                        Ok(ws) => {
                            session::spawn(ws, remote, server);
                        }
                        Err(e) => tracing::warn!(%remote, "websocket upgrade failed: {e}"),
                    }
                    return;
                }

                let keep_alive = request.keep_alive();
                if respond_plain(&mut stream, &request).await.is_err() {
                    return;
                }
                if !keep_alive {
                    let _ = stream.shutdown().await;
                    return;
                }
            }
            ReadOutcome::Eof => {
                let _ = stream.shutdown().await;
                return;
            }
            ReadOutcome::TooLarge => {
                tracing::warn!(%remote, "request too large, closing connection");
                return;
            }
            ReadOutcome::Malformed => {
                let _ = respond_bad_request(&mut stream).await;
                return;
            }
            ReadOutcome::Io => return,
        }
    }
}

/// Reads one complete request (headers + body) into `buf`, leaving any
/// pipelined bytes of the next request in place.
async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> ReadOutcome {
    let head_end = loop {
        if let Some(pos) = find_header_end(buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return ReadOutcome::TooLarge;
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return ReadOutcome::Io,
        }
    };
    if head_end > MAX_HEADER_BYTES {
        return ReadOutcome::TooLarge;
    }

    let request = {
        let Ok(head) = std::str::from_utf8(&buf[..head_end]) else {
            return ReadOutcome::Malformed;
        };
        match parse_request(head) {
            Some(request) => request,
            None => return ReadOutcome::Malformed,
        }
    };
    buf.drain(..head_end + 4);

    if request.content_length > MAX_BODY_BYTES {
        return ReadOutcome::TooLarge;
    }
    while buf.len() < request.content_length {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return ReadOutcome::Io,
        }
    }
    buf.drain(..request.content_length);

    ReadOutcome::Request(request)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses the request line and headers. Returns `None` for anything
/// ill-formed: bad request line, unsupported version, folded or malformed
/// headers, bad content-length, or any transfer-encoding.
fn parse_request(head: &str) -> Option<Request> {
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();
    let version = parts.next()?;
    if parts.next().is_some() || method.is_empty() || target.is_empty() {
        return None;
    }
    let version_11 = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => return None,
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() || line.starts_with(' ') || line.starts_with('\t') {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        if name.is_empty() || name.contains(' ') {
            return None;
        }
        headers.push((name.to_ascii_lowercase(), value.trim().to_owned()));
    }

    let request = Request {
        method,
        target,
        version_11,
        headers,
        content_length: 0,
    };
    if request.header("transfer-encoding").is_some() {
        return None;
    }
    let content_length = match request.header("content-length") {
        Some(value) => value.parse().ok()?,
        None => 0,
    };
    Some(Request {
        content_length,
        ..request
    })
}

/// Completes the WebSocket handshake and wraps the socket.
async fn upgrade(
    mut stream: TcpStream,
    request: &Request,
) -> Result<WebSocketStream<TcpStream>, UpgradeError> {
    let well_formed = request.method == "GET"
        && request.version_11
        && request.header("sec-websocket-version") == Some("13");
    let key = request.header("sec-websocket-key");
    let (true, Some(key)) = (well_formed, key) else {
        let _ = respond_bad_request(&mut stream).await;
        return Err(UpgradeError::BadRequest);
    };

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Server: {SERVER_IDENT}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}

#[derive(Debug, thiserror::Error)]
enum UpgradeError {
    #[error("ill-formed upgrade request")]
    BadRequest,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn respond_plain(stream: &mut TcpStream, request: &Request) -> std::io::Result<()> {
    let status = if request.target == "/" {
        "200 OK"
    } else {
        "404 Not Found"
    };
    let connection = if request.keep_alive() {
        "keep-alive"
    } else {
        "close"
    };
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Server: {SERVER_IDENT}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: {connection}\r\n\r\n\
         {PROBE_BODY}",
        PROBE_BODY.len()
    );
    stream.write_all(response.as_bytes()).await
}

async fn respond_bad_request(stream: &mut TcpStream) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Server: {SERVER_IDENT}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n\
         {BAD_REQUEST_BODY}",
        BAD_REQUEST_BODY.len()
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(head: &str) -> Option<Request> {
        parse_request(head)
    }

    #[test]
    fn parses_simple_get() {
        let request = parse("GET / HTTP/1.1\r\nHost: example").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/");
        assert!(request.version_11);
        assert_eq!(request.header("host"), Some("example"));
        assert_eq!(request.content_length, 0);
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let request = parse("GET / HTTP/1.1\r\nCoNtEnT-LeNgTh: 12").unwrap();
        assert_eq!(request.content_length, 12);
    }

    #[test]
    fn rejects_bad_version() {
        assert!(parse("GET / HTTP/2.0\r\n").is_none());
        assert!(parse("GET / FTP/1.1\r\n").is_none());
    }

    #[test]
    fn rejects_bad_request_line() {
        assert!(parse("GET /\r\n").is_none());
        assert!(parse("GET / HTTP/1.1 extra\r\n").is_none());
        assert!(parse(" / HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn rejects_folded_header() {
        assert!(parse("GET / HTTP/1.1\r\nX: a\r\n b").is_none());
    }

    #[test]
    fn rejects_header_without_colon() {
        assert!(parse("GET / HTTP/1.1\r\nnocolon").is_none());
    }

    #[test]
    fn rejects_bad_content_length() {
        assert!(parse("GET / HTTP/1.1\r\nContent-Length: nope").is_none());
    }

    #[test]
    fn rejects_transfer_encoding() {
        assert!(parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked").is_none());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(parse("GET / HTTP/1.1\r\nHost: x").unwrap().keep_alive());
        assert!(!parse("GET / HTTP/1.0\r\nHost: x").unwrap().keep_alive());
        assert!(!parse("GET / HTTP/1.1\r\nConnection: close")
            .unwrap()
            .keep_alive());
        assert!(parse("GET / HTTP/1.0\r\nConnection: keep-alive")
            .unwrap()
            .keep_alive());
    }

    #[test]
    fn detects_websocket_upgrade() {
        let request = parse(
            "GET /ws HTTP/1.1\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Upgrade: WebSocket\r\n\
             Sec-WebSocket-Key: abc\r\n\
             Sec-WebSocket-Version: 13",
        )
        .unwrap();
        assert!(request.wants_upgrade());

        let plain = parse("GET / HTTP/1.1\r\nHost: x").unwrap();
        assert!(!plain.wants_upgrade());
    }

    #[test]
    fn finds_header_terminator() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(14));
        assert_eq!(find_header_end(b"partial\r\n"), None);
    }
}
