use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{MessageLog, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::ParserCtx;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Typed RESP value. Commands and replies are preserved verbatim in
/// mocks; this decoded form exists for framing and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

/// Decode one RESP value. `Ok(None)` means the buffer is incomplete.
/// On success returns the value and the number of bytes it consumed.
pub fn decode(i: &[u8]) -> Result<Option<(RespValue, usize)>> {
    fn line(i: &[u8], from: usize) -> Option<(usize, usize)> {
        // (content end, total consumed incl. CRLF)
        let rel = i[from..].windows(2).position(|w| w == b"\r\n")?;
        Some((from + rel, from + rel + 2))
    }

    if i.is_empty() {
        return Ok(None);
    }
    match i[0] {
        b'+' | b'-' | b':' => {
            let Some((end, consumed)) = line(i, 1) else {
                return Ok(None);
            };
            let text = String::from_utf8_lossy(&i[1..end]).into_owned();
            let value = match i[0] {
                b'+' => RespValue::Simple(text),
                b'-' => RespValue::Error(text),
                _ => RespValue::Integer(text.parse().map_err(|_| {
                    ProxyError::malformed("RESP integer", text.clone())
                })?),
            };
            Ok(Some((value, consumed)))
        }
        b'$' => {
            let Some((end, consumed)) = line(i, 1) else {
                return Ok(None);
            };
            let len: i64 = String::from_utf8_lossy(&i[1..end])
                .parse()
                .map_err(|_| ProxyError::malformed("RESP bulk length", "not a number"))?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), consumed)));
            }
            let need = consumed + len as usize + 2;
            if i.len() < need {
                return Ok(None);
            }
            let body = i[consumed..consumed + len as usize].to_vec();
            Ok(Some((RespValue::Bulk(Some(body)), need)))
        }
        b'*' => {
            let Some((end, mut consumed)) = line(i, 1) else {
                return Ok(None);
            };
            let len: i64 = String::from_utf8_lossy(&i[1..end])
                .parse()
                .map_err(|_| ProxyError::malformed("RESP array length", "not a number"))?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), consumed)));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match decode(&i[consumed..])? {
                    Some((item, used)) => {
                        items.push(item);
                        consumed += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), consumed)))
        }
        other => Err(ProxyError::Unsupported {
            field: "RESP prefix",
            value: other as u64,
        }),
    }
}

pub fn encode(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(body)) => {
            out.push(b'$');
            out.extend_from_slice(body.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode(item, out);
            }
        }
    }
}

/// Read whole RESP values from `conn` into `buf`, returning the raw
/// bytes of exactly one value.
async fn read_value(conn: &mut FlowConn, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some((_, consumed)) = decode(&buf[..])? {
            let raw = buf[..consumed].to_vec();
            buf.advance(consumed);
            return Ok(Some(raw));
        }
        let mut chunk = [0u8; 4096];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated RESP value",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub struct RedisParser;

impl RedisParser {
    pub fn match_type(peek: &[u8]) -> bool {
        matches!(peek.first(), Some(b'+' | b'-' | b':' | b'$' | b'*'))
    }

    /// Lock-step command/reply relay; each exchange becomes one mock
    /// with command and reply preserved verbatim.
    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut client_buf = BytesMut::new();
        let mut upstream_buf = BytesMut::new();

        loop {
            let Some(command) = read_value(client, &mut client_buf).await? else {
                return Ok(());
            };
            upstream.write_all(&command).await?;
            upstream.flush().await?;

            let Some(reply) = ctx
                .with_read_timeout(read_value(upstream, &mut upstream_buf))
                .await?
            else {
                return Ok(());
            };
            client.write_all(&reply).await?;
            client.flush().await?;

            let log = MessageLog {
                requests: vec![WirePayload::from_bytes(&command)],
                responses: vec![WirePayload::from_bytes(&reply)],
            };
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Redis(log)))
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
            let Some(command) = read_value(client, &mut buf).await? else {
                return Ok(());
            };

            let matched = store
                .get_filtered_by_kind(MockKind::Redis)
                .into_iter()
                .chain(store.get_unfiltered_by_kind(MockKind::Redis))
                .find(|m| match &m.spec {
                    MockSpec::Redis(log) => log
                        .requests
                        .first()
                        .map(|req| req.bytes() == command)
                        .unwrap_or(false),
                    _ => false,
                });

            let Some(mock) = matched else {
                let err = ProxyError::MockNotFound {
                    kind: MockKind::Redis,
                    connection_id: ctx.connection_id.clone(),
                };
                ctx.report(&err).await;
                return Err(err);
            };

            if let MockSpec::Redis(log) = &mock.spec {
                for reply in &log.responses {
                    client.write_all(&reply.bytes()).await?;
                }
                client.flush().await?;
            }
            ctx.consume(store, &mock).await;
        }
    }
}
