use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{MessageLog, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::ParserCtx;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub const HEADER_LEN: usize = 16;
pub const OP_REPLY: u32 = 1;
pub const OP_QUERY: u32 = 2004;
pub const OP_MSG: u32 = 2013;

const MAX_MESSAGE_LEN: usize = 48 * 1024 * 1024;

/// Standard 16-byte wire header, all fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: u32,
}

impl MsgHeader {
    pub fn parse(i: &[u8]) -> Option<MsgHeader> {
        if i.len() < HEADER_LEN {
            return None;
        }
        Some(MsgHeader {
            message_length: LittleEndian::read_u32(&i[0..4]),
            request_id: LittleEndian::read_u32(&i[4..8]),
            response_to: LittleEndian::read_u32(&i[8..12]),
            op_code: LittleEndian::read_u32(&i[12..16]),
        })
    }
}

/// OP_MSG body section: a kind byte, then a BSON document (kind 0) or
/// a size-prefixed document sequence (kind 1).
#[derive(Debug, Clone, PartialEq)]
pub enum MsgSection {
    Body(bson::Document),
    DocumentSequence {
        identifier: String,
        documents: Vec<bson::Document>,
    },
}

/// Decode the sections of an OP_MSG payload (after flagBits).
pub fn decode_op_msg_sections(mut i: &[u8]) -> Result<Vec<MsgSection>> {
    let mut sections = Vec::new();
    while !i.is_empty() {
        let kind = i[0];
        i = &i[1..];
        match kind {
            0 => {
                let doc_len = doc_len(i)?;
                let doc = bson::Document::from_reader(&mut &i[..doc_len])
                    .map_err(|e| ProxyError::malformed("OP_MSG body", e.to_string()))?;
                sections.push(MsgSection::Body(doc));
                i = &i[doc_len..];
            }
            1 => {
                if i.len() < 4 {
                    return Err(ProxyError::ShortBuffer { needed: 4 });
                }
                let section_len = LittleEndian::read_u32(&i[0..4]) as usize;
                if section_len < 4 || i.len() < section_len {
                    return Err(ProxyError::malformed("OP_MSG section", "bad length"));
                }
                let mut body = &i[4..section_len];
                let nul = body
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| ProxyError::malformed("OP_MSG section", "no identifier"))?;
                let identifier = String::from_utf8_lossy(&body[..nul]).into_owned();
                body = &body[nul + 1..];
                let mut documents = Vec::new();
                while !body.is_empty() {
                    let len = doc_len(body)?;
                    let doc = bson::Document::from_reader(&mut &body[..len])
                        .map_err(|e| ProxyError::malformed("OP_MSG sequence", e.to_string()))?;
                    documents.push(doc);
                    body = &body[len..];
                }
                sections.push(MsgSection::DocumentSequence {
                    identifier,
                    documents,
                });
                i = &i[section_len..];
            }
            other => {
                return Err(ProxyError::Unsupported {
                    field: "OP_MSG section kind",
                    value: other as u64,
                })
            }
        }
    }
    Ok(sections)
}

fn doc_len(i: &[u8]) -> Result<usize> {
    if i.len() < 4 {
        return Err(ProxyError::ShortBuffer { needed: 4 });
    }
    let len = LittleEndian::read_u32(&i[0..4]) as usize;
    if len < 5 || len > i.len() {
        return Err(ProxyError::malformed("BSON document", "bad length prefix"));
    }
    Ok(len)
}

/// The request shape of a Mongo message, with the run-dependent header
/// ids masked out.
pub fn shape_key(message: &[u8]) -> &[u8] {
    if message.len() > HEADER_LEN {
        &message[12..]
    } else {
        message
    }
}

/// Rewrite a recorded response so its `responseTo` links to the live
/// request id.
pub fn relink_response(mut message: Vec<u8>, request_id: u32) -> Vec<u8> {
    if message.len() >= HEADER_LEN {
        LittleEndian::write_u32(&mut message[8..12], request_id);
    }
    message
}

async fn read_message(conn: &mut FlowConn, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    loop {
        if buf.len() >= HEADER_LEN {
            let len = LittleEndian::read_u32(&buf[0..4]) as usize;
            if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
                return Err(ProxyError::malformed("mongo message", "implausible length"));
            }
            if buf.len() >= len {
                let raw = buf[..len].to_vec();
                buf.advance(len);
                return Ok(Some(raw));
            }
        }
        let mut chunk = [0u8; 8192];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated mongo message",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub struct MongoParser;

impl MongoParser {
    /// A plausible little-endian message length in the first four
    /// bytes. Text protocols fail the bound; Postgres has a zero
    /// leading byte and is checked at higher priority.
    pub fn match_type(peek: &[u8]) -> bool {
        if peek.len() < 4 || peek[0] == 0 {
            return false;
        }
        let len = LittleEndian::read_u32(&peek[0..4]) as usize;
        (HEADER_LEN..MAX_MESSAGE_LEN).contains(&len)
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut client_buf = BytesMut::new();
        let mut upstream_buf = BytesMut::new();

        loop {
            let Some(request) = read_message(client, &mut client_buf).await? else {
                return Ok(());
            };
            upstream.write_all(&request).await?;
            upstream.flush().await?;

            let header = MsgHeader::parse(&request);
            let mut log = MessageLog {
                requests: vec![WirePayload::from_bytes(&request)],
                responses: vec![],
            };
            // fire-and-forget messages carry no reply
            let expects_reply = matches!(
                header.map(|h| h.op_code),
                Some(OP_QUERY) | Some(OP_MSG) | None
            ) && !more_to_come_suppressed(&request);
            if expects_reply {
                let Some(reply) = ctx
                    .with_read_timeout(read_message(upstream, &mut upstream_buf))
                    .await?
                else {
                    return Ok(());
                };
                client.write_all(&reply).await?;
                client.flush().await?;
                log.responses.push(WirePayload::from_bytes(&reply));
            }
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Mongo(log)))
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
            let Some(request) = read_message(client, &mut buf).await? else {
                return Ok(());
            };
            let header = MsgHeader::parse(&request);
            let key = shape_key(&request);

            let matched = store
                .get_filtered_by_kind(MockKind::Mongo)
                .into_iter()
                .chain(store.get_unfiltered_by_kind(MockKind::Mongo))
                .find(|m| match &m.spec {
                    MockSpec::Mongo(log) => log
                        .requests
                        .first()
                        .map(|req| shape_key(&req.bytes()) == key)
                        .unwrap_or(false),
                    _ => false,
                });

            let Some(mock) = matched else {
                let err = ProxyError::MockNotFound {
                    kind: MockKind::Mongo,
                    connection_id: ctx.connection_id.clone(),
                };
                ctx.report(&err).await;
                return Err(err);
            };
            debug!("RetraceProxy mongo replay hit mock {}", mock.name);
            if let MockSpec::Mongo(log) = &mock.spec {
                for response in &log.responses {
                    let wire = relink_response(
                        response.bytes(),
                        header.map(|h| h.request_id).unwrap_or(0),
                    );
                    client.write_all(&wire).await?;
                }
                client.flush().await?;
            }
            ctx.consume(store, &mock).await;
        }
    }
}

/// OP_MSG flagBits bit 1 (moreToCome) set by the sender means "do not
/// reply".
fn more_to_come_suppressed(message: &[u8]) -> bool {
    if message.len() < HEADER_LEN + 4 {
        return false;
    }
    let header = match MsgHeader::parse(message) {
        Some(h) => h,
        None => return false,
    };
    if header.op_code != OP_MSG {
        return false;
    }
    let flags = LittleEndian::read_u32(&message[HEADER_LEN..HEADER_LEN + 4]);
    flags & 0x2 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn op_msg(request_id: u32, body: &bson::Document) -> Vec<u8> {
        let mut doc_bytes = Vec::new();
        body.to_writer(&mut doc_bytes).unwrap();
        let len = HEADER_LEN + 4 + 1 + doc_bytes.len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&request_id.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&OP_MSG.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // flagBits
        out.push(0); // section kind: body
        out.extend_from_slice(&doc_bytes);
        out
    }

    #[test]
    fn header_parse() {
        let wire = op_msg(11, &doc! {"ping": 1});
        let header = MsgHeader::parse(&wire).unwrap();
        assert_eq!(header.message_length as usize, wire.len());
        assert_eq!(header.request_id, 11);
        assert_eq!(header.op_code, OP_MSG);
    }

    #[test]
    fn op_msg_body_section() {
        let wire = op_msg(1, &doc! {"find": "users", "$db": "app"});
        let sections = decode_op_msg_sections(&wire[HEADER_LEN + 4..]).unwrap();
        assert_eq!(sections.len(), 1);
        match &sections[0] {
            MsgSection::Body(doc) => {
                assert_eq!(doc.get_str("find").unwrap(), "users");
                assert_eq!(doc.get_str("$db").unwrap(), "app");
            }
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn shape_key_masks_run_dependent_ids() {
        let a = op_msg(1, &doc! {"ping": 1});
        let b = op_msg(99, &doc! {"ping": 1});
        assert_ne!(a, b);
        assert_eq!(shape_key(&a), shape_key(&b));
    }

    #[test]
    fn relink_rewrites_response_to() {
        let reply = op_msg(500, &doc! {"ok": 1});
        let relinked = relink_response(reply.clone(), 42);
        let header = MsgHeader::parse(&relinked).unwrap();
        assert_eq!(header.response_to, 42);
        // body untouched
        assert_eq!(&relinked[12..], &reply[12..]);
    }

    #[test]
    fn match_type_bounds() {
        let wire = op_msg(1, &doc! {"ping": 1});
        assert!(MongoParser::match_type(&wire[..5]));
        assert!(!MongoParser::match_type(b"GET /"));
        assert!(!MongoParser::match_type(&[0x00, 0x00, 0x00, 0x52, 0x00]));
    }
}
