use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{MessageLog, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::ParserCtx;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub const STARTUP_PROTOCOL_V3: u32 = 196608;
pub const SSL_REQUEST_CODE: u32 = 80877103;
pub const META_PHASE: &str = "phase";
pub const PHASE_STARTUP: &str = "startup";

/// One Postgres v3 message. Startup-phase messages carry no tag byte;
/// everything after the startup handshake is `tag + len + payload`.
/// Mocks retain the raw bytes; the tag is the replay variant key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgMessage {
    pub tag: Option<u8>,
    pub payload: Vec<u8>,
}

impl PgMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 5);
        if let Some(tag) = self.tag {
            out.push(tag);
        }
        out.extend_from_slice(&((self.payload.len() as u32 + 4).to_be_bytes()));
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Decode one tagged (regular-phase) message; `Ok(None)` = incomplete.
pub fn decode_tagged(i: &[u8]) -> Result<Option<(PgMessage, usize)>> {
    if i.len() < 5 {
        return Ok(None);
    }
    let tag = i[0];
    let len = u32::from_be_bytes([i[1], i[2], i[3], i[4]]) as usize;
    if len < 4 {
        return Err(ProxyError::malformed("pg message", "length below 4"));
    }
    let total = 1 + len;
    if i.len() < total {
        return Ok(None);
    }
    Ok(Some((
        PgMessage {
            tag: Some(tag),
            payload: i[5..total].to_vec(),
        },
        total,
    )))
}

/// Decode one untagged startup-phase message.
pub fn decode_startup(i: &[u8]) -> Result<Option<(PgMessage, usize)>> {
    if i.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([i[0], i[1], i[2], i[3]]) as usize;
    if len < 4 {
        return Err(ProxyError::malformed("pg startup", "length below 4"));
    }
    if i.len() < len {
        return Ok(None);
    }
    Ok(Some((
        PgMessage {
            tag: None,
            payload: i[4..len].to_vec(),
        },
        len,
    )))
}

pub fn startup_code(msg: &PgMessage) -> Option<u32> {
    msg.payload
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

async fn fill<F, T>(conn: &mut FlowConn, buf: &mut BytesMut, decode: F) -> Result<Option<(T, Vec<u8>)>>
where
    F: Fn(&[u8]) -> Result<Option<(T, usize)>>,
{
    loop {
        if let Some((msg, consumed)) = decode(&buf[..])? {
            let raw = buf[..consumed].to_vec();
            buf.advance(consumed);
            return Ok(Some((msg, raw)));
        }
        let mut chunk = [0u8; 8192];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated pg message",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub struct PostgresParser;

impl PostgresParser {
    /// Startup messages begin with a big-endian length whose high byte
    /// is zero, followed by protocol 3.0 or the SSLRequest code.
    pub fn match_type(peek: &[u8]) -> bool {
        peek.len() >= 5 && peek[0] == 0x00 && (peek[4] == 0x00 || peek[4] == 0x04)
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut client_buf = BytesMut::new();
        let mut upstream_buf = BytesMut::new();

        // startup phase; SSLRequest is refused so the session stays in
        // clear text on both legs
        let startup_raw = loop {
            let Some((msg, raw)) = fill(client, &mut client_buf, decode_startup).await? else {
                return Ok(());
            };
            if startup_code(&msg) == Some(SSL_REQUEST_CODE) {
                client.write_all(b"N").await?;
                client.flush().await?;
                continue;
            }
            break raw;
        };
        upstream.write_all(&startup_raw).await?;
        upstream.flush().await?;

        let mut startup_log = MessageLog {
            requests: vec![WirePayload::from_bytes(&startup_raw)],
            responses: vec![],
        };
        // server replies until ReadyForQuery ('Z'); auth messages may
        // need client answers in between
        loop {
            let Some((msg, raw)) = fill(upstream, &mut upstream_buf, decode_tagged).await? else {
                return Ok(());
            };
            client.write_all(&raw).await?;
            client.flush().await?;
            startup_log.responses.push(WirePayload::from_bytes(&raw));
            match msg.tag {
                Some(b'Z') => break,
                Some(b'R') if matches!(startup_code(&msg), Some(3 | 5 | 10 | 11)) => {
                    // authentication request that needs a client answer
                    // (cleartext, md5, SASL, SASL continue)
                    let Some((_, answer)) = fill(client, &mut client_buf, decode_tagged).await?
                    else {
                        return Ok(());
                    };
                    upstream.write_all(&answer).await?;
                    upstream.flush().await?;
                    startup_log.requests.push(WirePayload::from_bytes(&answer));
                }
                Some(b'E') => break,
                _ => {}
            }
        }
        ctx.emit(
            Mock::captured(&ctx.connection_id, MockSpec::Postgres(startup_log))
                .with_meta(META_PHASE, PHASE_STARTUP),
        )
        .await;

        // query phase: gather one client batch (simple 'Q' or extended
        // protocol up to Sync), then the server messages to
        // ReadyForQuery
        loop {
            let mut log = MessageLog::default();
            loop {
                let Some((msg, raw)) = fill(client, &mut client_buf, decode_tagged).await? else {
                    return Ok(());
                };
                upstream.write_all(&raw).await?;
                upstream.flush().await?;
                log.requests.push(WirePayload::from_bytes(&raw));
                match msg.tag {
                    Some(b'X') => return Ok(()),
                    Some(b'Q') | Some(b'S') => break,
                    _ => {}
                }
            }
            loop {
                let Some((msg, raw)) = fill(upstream, &mut upstream_buf, decode_tagged).await?
                else {
                    return Ok(());
                };
                client.write_all(&raw).await?;
                client.flush().await?;
                log.responses.push(WirePayload::from_bytes(&raw));
                if msg.tag == Some(b'Z') {
                    break;
                }
            }
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Postgres(log)))
                .await;
        }
    }

    pub async fn replay(ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        let store = ctx
            .session
            .mock_store
            .as_ref()
            .ok_or_else(|| ProxyError::malformed("replay", "session has no mock store"))?;
        let mut client_buf = BytesMut::new();

        // startup: refuse SSL, then answer from the startup mock
        loop {
            let Some((msg, _raw)) = fill(client, &mut client_buf, decode_startup).await? else {
                return Ok(());
            };
            if startup_code(&msg) == Some(SSL_REQUEST_CODE) {
                client.write_all(b"N").await?;
                client.flush().await?;
                continue;
            }
            break;
        }
        let startup = store
            .get_filtered_by_kind(MockKind::Postgres)
            .into_iter()
            .chain(store.get_unfiltered_by_kind(MockKind::Postgres))
            .find(|m| m.metadata.get(META_PHASE).map(String::as_str) == Some(PHASE_STARTUP));
        let Some(startup) = startup else {
            let err = ProxyError::MockNotFound {
                kind: MockKind::Postgres,
                connection_id: ctx.connection_id.clone(),
            };
            ctx.report(&err).await;
            return Err(err);
        };
        if let MockSpec::Postgres(log) = &startup.spec {
            for response in &log.responses {
                client.write_all(&response.bytes()).await?;
            }
            client.flush().await?;
        }

        loop {
            let mut batch: Vec<Vec<u8>> = Vec::new();
            loop {
                let Some((msg, raw)) = fill(client, &mut client_buf, decode_tagged).await? else {
                    return Ok(());
                };
                let tag = msg.tag;
                batch.push(raw);
                match tag {
                    Some(b'X') => return Ok(()),
                    Some(b'Q') | Some(b'S') => break,
                    _ => {}
                }
            }
            let flat: Vec<u8> = batch.concat();

            let matched = store
                .get_filtered_by_kind(MockKind::Postgres)
                .into_iter()
                .chain(store.get_unfiltered_by_kind(MockKind::Postgres))
                .find(|m| {
                    if m.metadata.get(META_PHASE).map(String::as_str) == Some(PHASE_STARTUP) {
                        return false;
                    }
                    match &m.spec {
                        MockSpec::Postgres(log) => {
                            let recorded: Vec<u8> = log
                                .requests
                                .iter()
                                .flat_map(|r| r.bytes())
                                .collect();
                            recorded == flat
                        }
                        _ => false,
                    }
                });

            let Some(mock) = matched else {
                let err = ProxyError::MockNotFound {
                    kind: MockKind::Postgres,
                    connection_id: ctx.connection_id.clone(),
                };
                ctx.report(&err).await;
                return Err(err);
            };
            debug!("RetraceProxy postgres replay hit mock {}", mock.name);
            if let MockSpec::Postgres(log) = &mock.spec {
                for response in &log.responses {
                    client.write_all(&response.bytes()).await?;
                }
                client.flush().await?;
            }
            ctx.consume(store, &mock).await;
        }
    }
}
