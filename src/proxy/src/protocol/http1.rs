use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{HttpExchange, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::ParserCtx;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const METHOD_PREFIXES: [&[u8]; 9] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"OPTI", b"PATC", b"CONN", b"TRAC",
];

/// Parsed head of a request or response: the start line split into its
/// three parts plus the header fields in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    pub start: [String; 3],
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// A request or response is "complete at headers" only once the
/// `\r\n\r\n` terminator is present; parsing never runs on a shorter
/// prefix.
pub fn parse_head(head_bytes: &[u8]) -> Result<HttpHead> {
    let text = std::str::from_utf8(head_bytes)
        .map_err(|_| ProxyError::malformed("http head", "not utf-8"))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| ProxyError::malformed("http head", "empty"))?;
    let mut parts = start_line.splitn(3, ' ');
    let start = [
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    ];
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::malformed("http header", line.to_string()))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(HttpHead { start, headers })
}

/// Accumulate bytes until the header terminator appears; returns the
/// raw head (terminator included). `Ok(None)` on clean EOF before any
/// bytes.
async fn read_head(conn: &mut FlowConn, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some(pos) = find_terminator(&buf[..]) {
            let head = buf[..pos + 4].to_vec();
            buf.advance(pos + 4);
            return Ok(Some(head));
        }
        let mut chunk = [0u8; 8192];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside http headers",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Read the message body that follows `head`, honoring Content-Length
/// and chunked framing. `until_eof` applies to responses without
/// either marker.
async fn read_body(
    conn: &mut FlowConn,
    buf: &mut BytesMut,
    head: &HttpHead,
    until_eof: bool,
) -> Result<Vec<u8>> {
    if let Some(len) = head.content_length() {
        while buf.len() < len {
            let mut chunk = [0u8; 8192];
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed inside http body",
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = buf[..len].to_vec();
        buf.advance(len);
        return Ok(body);
    }
    if head.is_chunked() {
        return read_chunked_body(conn, buf).await;
    }
    if until_eof {
        let mut body = buf[..].to_vec();
        buf.clear();
        let mut chunk = [0u8; 8192];
        loop {
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }
    Ok(Vec::new())
}

/// Chunked body including the chunk-size framing bytes, so the raw
/// dump stays byte-exact.
async fn read_chunked_body(conn: &mut FlowConn, buf: &mut BytesMut) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        // chunk size line
        let line_end = loop {
            if let Some(pos) = buf[..].windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 8192];
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::malformed("chunked body", "eof in chunk size"));
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let size_line = buf[..line_end].to_vec();
        let size_text = String::from_utf8_lossy(&size_line);
        let size = usize::from_str_radix(size_text.trim().split(';').next().unwrap_or("0"), 16)
            .map_err(|_| ProxyError::malformed("chunked body", "bad chunk size"))?;
        let frame_len = line_end + 2 + size + 2;
        while buf.len() < frame_len {
            let mut chunk = [0u8; 8192];
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::malformed("chunked body", "eof in chunk data"));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        body.extend_from_slice(&buf[..frame_len]);
        buf.advance(frame_len);
        if size == 0 {
            return Ok(body);
        }
    }
}

pub struct Http1Parser;

impl Http1Parser {
    pub fn match_type(peek: &[u8]) -> bool {
        METHOD_PREFIXES
            .iter()
            .any(|prefix| peek.len() >= prefix.len() && &peek[..prefix.len()] == *prefix)
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut client_buf = BytesMut::new();
        let mut upstream_buf = BytesMut::new();

        loop {
            let Some(req_head_raw) = read_head(client, &mut client_buf).await? else {
                return Ok(());
            };
            let req_head = parse_head(&req_head_raw)?;
            let req_body = read_body(client, &mut client_buf, &req_head, false).await?;

            let mut raw_request = req_head_raw.clone();
            raw_request.extend_from_slice(&req_body);
            upstream.write_all(&raw_request).await?;
            upstream.flush().await?;

            let Some(resp_head_raw) = ctx
                .with_read_timeout(read_head(upstream, &mut upstream_buf))
                .await?
            else {
                return Ok(());
            };
            let resp_head = parse_head(&resp_head_raw)?;
            let resp_body = read_body(upstream, &mut upstream_buf, &resp_head, true).await?;

            let mut raw_response = resp_head_raw.clone();
            raw_response.extend_from_slice(&resp_body);
            client.write_all(&raw_response).await?;
            client.flush().await?;

            let host = req_head.header("host").unwrap_or_default().to_string();
            let url = req_head.start[1].clone();
            if ctx.bypassed(&host, &url) {
                debug!("RetraceProxy http bypass rule hit for {host}{url}");
                continue;
            }

            let status_code = resp_head.start[1].parse().unwrap_or(0);
            let exchange = HttpExchange {
                method: req_head.start[0].clone(),
                url,
                proto: req_head.start[2].clone(),
                request_headers: req_head.headers.clone(),
                request_body: WirePayload::from_bytes(&req_body),
                status_code,
                response_headers: resp_head.headers.clone(),
                response_body: WirePayload::from_bytes(&resp_body),
                raw_request: WirePayload::from_bytes(&raw_request),
                raw_response: WirePayload::from_bytes(&raw_response),
            };
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Http(exchange)))
                .await;
        }
    }

    pub async fn replay(ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        let store = ctx
            .session
            .mock_store
            .as_ref()
            .ok_or_else(|| ProxyError::malformed("replay", "session has no mock store"))?;
        let mut buf = BytesMut::new();

        loop {
            let Some(head_raw) = read_head(client, &mut buf).await? else {
                return Ok(());
            };
            let head = parse_head(&head_raw)?;
            let body = read_body(client, &mut buf, &head, false).await?;

            let matched = store
                .get_filtered_by_kind(MockKind::Http)
                .into_iter()
                .chain(store.get_unfiltered_by_kind(MockKind::Http))
                .find(|m| match &m.spec {
                    MockSpec::Http(ex) => {
                        ex.method == head.start[0]
                            && ex.url == head.start[1]
                            && ex.request_body.bytes() == body
                    }
                    _ => false,
                });

            let Some(mock) = matched else {
                let err = ProxyError::MockNotFound {
                    kind: MockKind::Http,
                    connection_id: ctx.connection_id.clone(),
                };
                ctx.report(&err).await;
                return Err(err);
            };
            debug!("RetraceProxy http replay hit mock {}", mock.name);
            if let MockSpec::Http(ex) = &mock.spec {
                client.write_all(&ex.raw_response.bytes()).await?;
                client.flush().await?;
            }
            ctx.consume(store, &mock).await;
        }
    }
}
