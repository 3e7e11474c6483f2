use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{GrpcExchange, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::grpc::{
    decode_header_block, encode_response_headers, encode_trailers, GrpcMessage,
};
use crate::protocol::ParserCtx;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// The fixed 24-byte client connection preface.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_ACK: u8 = 0x1;

/// One HTTP/2 frame, headers big-endian per RFC 9113; `raw` preserves
/// the received bytes so replay is bit-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Frame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
    pub raw: Vec<u8>,
}

impl Http2Frame {
    pub fn parse(i: &[u8]) -> Option<(Http2Frame, usize)> {
        if i.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length = BigEndian::read_u24(&i[0..3]) as usize;
        let total = FRAME_HEADER_LEN + length;
        if i.len() < total {
            return None;
        }
        Some((
            Http2Frame {
                frame_type: i[3],
                flags: i[4],
                stream_id: BigEndian::read_u32(&i[5..9]) & 0x7fff_ffff,
                payload: i[FRAME_HEADER_LEN..total].to_vec(),
                raw: i[..total].to_vec(),
            },
            total,
        ))
    }

    pub fn encode(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        let mut len = [0u8; 3];
        BigEndian::write_u24(&mut len, payload.len() as u32);
        out.extend_from_slice(&len);
        out.push(frame_type);
        out.push(flags);
        out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// The header block of a HEADERS frame with PADDED and PRIORITY
/// adjustments stripped.
fn header_block(frame: &Http2Frame) -> &[u8] {
    const FLAG_PADDED: u8 = 0x8;
    const FLAG_PRIORITY: u8 = 0x20;
    let mut block = frame.payload.as_slice();
    let mut pad = 0usize;
    if frame.flags & FLAG_PADDED != 0 {
        let Some((&first, rest)) = block.split_first() else {
            return &[];
        };
        pad = first as usize;
        block = rest;
    }
    if frame.flags & FLAG_PRIORITY != 0 {
        if block.len() < 5 {
            return &[];
        }
        block = &block[5..];
    }
    if pad <= block.len() {
        &block[..block.len() - pad]
    } else {
        &[]
    }
}

async fn read_frame(conn: &mut FlowConn, buf: &mut BytesMut) -> Result<Option<Http2Frame>> {
    loop {
        if let Some((frame, consumed)) = Http2Frame::parse(&buf[..]) {
            buf.advance(consumed);
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 16384];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated http2 frame",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// HTTP/2 and gRPC flow driver. Frames pass through untouched; the
/// captured mock keeps them verbatim, enriched with the pseudo-headers
/// and trailer values the header blocks reveal.
pub struct Http2Parser;

impl Http2Parser {
    /// Detection keys on the connection preface prefix.
    pub fn match_type(peek: &[u8]) -> bool {
        let n = peek.len().min(PREFACE.len());
        n > 0 && peek[..n] == PREFACE[..n]
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut preface = [0u8; 24];
        client.read_exact(&mut preface).await?;
        if &preface != PREFACE {
            return Err(ProxyError::malformed("http2 preface", "bad magic"));
        }
        upstream.write_all(&preface).await?;
        upstream.flush().await?;

        let mut exchange = GrpcExchange::default();
        let mut client_buf = BytesMut::new();
        let mut upstream_buf = BytesMut::new();

        loop {
            tokio::select! {
                frame = read_frame(client, &mut client_buf) => {
                    let Some(frame) = frame? else { break };
                    upstream.write_all(&frame.raw).await?;
                    upstream.flush().await?;
                    if frame.frame_type == FRAME_HEADERS && exchange.pseudo.path.is_empty() {
                        for (name, value) in decode_header_block(header_block(&frame)) {
                            match name.as_str() {
                                ":method" => exchange.pseudo.method = value,
                                ":scheme" => exchange.pseudo.scheme = value,
                                ":path" => exchange.pseudo.path = value,
                                ":authority" => exchange.pseudo.authority = value,
                                _ => {}
                            }
                        }
                    }
                    exchange.request_frames.push(WirePayload::from_bytes(&frame.raw));
                }
                frame = read_frame(upstream, &mut upstream_buf) => {
                    let Some(frame) = frame? else { break };
                    client.write_all(&frame.raw).await?;
                    client.flush().await?;
                    if frame.frame_type == FRAME_HEADERS {
                        for (name, value) in decode_header_block(header_block(&frame)) {
                            match name.as_str() {
                                "grpc-status" => exchange.grpc_status = value,
                                "grpc-message" => exchange.grpc_message = value,
                                _ => {}
                            }
                        }
                    }
                    if frame.frame_type == FRAME_DATA && exchange.response_message.is_none() {
                        if let Some((message, _)) = GrpcMessage::decode(&frame.payload) {
                            exchange.response_message =
                                Some(WirePayload::from_bytes(&message.payload));
                        }
                    }
                    exchange.response_frames.push(WirePayload::from_bytes(&frame.raw));
                }
            }
        }

        if !exchange.request_frames.is_empty() {
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Grpc(exchange)))
                .await;
        }
        Ok(())
    }

    pub async fn replay(ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        let store = ctx
            .session
            .mock_store
            .as_ref()
            .ok_or_else(|| ProxyError::malformed("replay", "session has no mock store"))?;

        let mut preface = [0u8; 24];
        client.read_exact(&mut preface).await?;
        if &preface != PREFACE {
            return Err(ProxyError::malformed("http2 preface", "bad magic"));
        }

        // collect client frames until the request is complete enough to
        // match: the first DATA frame, or an END_STREAM headers frame
        let mut buf = BytesMut::new();
        let mut first_data: Option<Vec<u8>> = None;
        loop {
            let Some(frame) = read_frame(client, &mut buf).await? else {
                return Ok(());
            };
            match frame.frame_type {
                FRAME_DATA => {
                    first_data = Some(frame.payload.clone());
                    break;
                }
                FRAME_HEADERS if frame.is_end_stream() => break,
                _ => {}
            }
        }

        let matched = store
            .get_filtered_by_kind(MockKind::Grpc)
            .into_iter()
            .chain(store.get_unfiltered_by_kind(MockKind::Grpc))
            .find(|m| match (&m.spec, &first_data) {
                (MockSpec::Grpc(ex), Some(data)) => ex
                    .request_frames
                    .iter()
                    .filter_map(|raw| Http2Frame::parse(&raw.bytes()).map(|(f, _)| f))
                    .any(|f| f.frame_type == FRAME_DATA && &f.payload == data),
                (MockSpec::Grpc(_), None) => true,
                _ => false,
            });

        let Some(mock) = matched else {
            let err = ProxyError::MockNotFound {
                kind: MockKind::Grpc,
                connection_id: ctx.connection_id.clone(),
            };
            ctx.report(&err).await;
            return Err(err);
        };
        debug!("RetraceProxy http2 replay hit mock {}", mock.name);

        if let MockSpec::Grpc(ex) = &mock.spec {
            if ex.response_frames.is_empty() {
                // hand-authored mock: synthesize the response from the
                // trailer values and the decoded message body
                let body = ex
                    .response_message
                    .as_ref()
                    .map(|m| m.bytes())
                    .unwrap_or_default();
                let reply = synthesize_grpc_response(&ex.grpc_status, &ex.grpc_message, &body);
                client.write_all(&reply).await?;
            } else {
                for frame in &ex.response_frames {
                    client.write_all(&frame.bytes()).await?;
                }
            }
            client.flush().await?;
        }
        ctx.consume(store, &mock).await;

        // drain the client until it hangs up
        let mut sink = [0u8; 16384];
        loop {
            let n = client.read(&mut sink).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }
}

/// Settings + headers + one gRPC data message + trailers, for mocks
/// that carry decoded trailer values instead of raw frames.
fn synthesize_grpc_response(status: &str, message: &str, grpc_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&Http2Frame::encode(FRAME_SETTINGS, 0, 0, &[]));
    out.extend_from_slice(&Http2Frame::encode(FRAME_SETTINGS, FLAG_ACK, 0, &[]));
    out.extend_from_slice(&Http2Frame::encode(
        FRAME_HEADERS,
        FLAG_END_HEADERS,
        1,
        &encode_response_headers(),
    ));
    let data = GrpcMessage {
        compressed: 0,
        payload: grpc_payload.to_vec(),
    };
    out.extend_from_slice(&Http2Frame::encode(FRAME_DATA, 0, 1, &data.encode()));
    out.extend_from_slice(&Http2Frame::encode(
        FRAME_HEADERS,
        FLAG_END_HEADERS | FLAG_END_STREAM,
        1,
        &encode_trailers(status, message),
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let wire = Http2Frame::encode(FRAME_DATA, FLAG_END_STREAM, 1, b"hello");
        let (frame, used) = Http2Frame::parse(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.frame_type, FRAME_DATA);
        assert!(frame.is_end_stream());
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.raw, wire);
    }

    #[test]
    fn frame_header_is_big_endian() {
        let wire = Http2Frame::encode(FRAME_DATA, 0, 0x0102, &[0xaa; 300]);
        assert_eq!(&wire[..3], &[0x00, 0x01, 0x2c]); // 300 BE u24
        assert_eq!(&wire[5..9], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn preface_detection_on_short_peek() {
        assert!(Http2Parser::match_type(b"PRI *"));
        assert!(Http2Parser::match_type(PREFACE));
        assert!(!Http2Parser::match_type(b"PRX *"));
        assert!(!Http2Parser::match_type(b"GET /"));
    }

    #[test]
    fn partial_frame_asks_for_more() {
        let wire = Http2Frame::encode(FRAME_HEADERS, 0, 1, &[0x00; 16]);
        assert!(Http2Frame::parse(&wire[..8]).is_none());
        assert!(Http2Frame::parse(&wire[..12]).is_none());
    }

    #[test]
    fn padded_header_block_is_stripped() {
        // PADDED flag: 1-byte pad length, block, pad bytes
        let mut payload = vec![0x02];
        payload.extend_from_slice(&crate::protocol::grpc::encode_trailers("0", ""));
        payload.extend_from_slice(&[0x00, 0x00]);
        let wire = Http2Frame::encode(FRAME_HEADERS, 0x8 | FLAG_END_HEADERS, 1, &payload);
        let (frame, _) = Http2Frame::parse(&wire).unwrap();
        let fields = decode_header_block(header_block(&frame));
        assert_eq!(fields, vec![("grpc-status".to_string(), "0".to_string())]);
    }

    #[tokio::test]
    async fn replay_synthesizes_from_hand_authored_mock() {
        use crate::conn::{FlowConn, Side};
        use crate::mock::{GrpcExchange, Mock, MockSpec, MockStore, WirePayload};
        use crate::protocol::{ConditionalDst, ParserCtx};
        use crate::session::{OutgoingOptions, Session};
        use std::sync::Arc;
        use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
        use tokio::sync::mpsc;

        let exchange = GrpcExchange {
            response_message: Some(WirePayload::from_bytes(b"hi")),
            grpc_status: "0".to_string(),
            ..Default::default()
        };
        let store = Arc::new(MockStore::new());
        store.set_filtered(vec![Mock::captured("rec", MockSpec::Grpc(exchange))]);
        let session = Session::test(1, OutgoingOptions::default(), store);
        let (err_tx, _err_rx) = mpsc::channel(8);
        let ctx = ParserCtx {
            connection_id: "conn-test".to_string(),
            session: Arc::new(session),
            dst: ConditionalDst {
                addr: "svc".to_string(),
                port: 50051,
                tls: None,
            },
            bypass_rules: vec![],
            error_tx: err_tx,
        };

        let (client_near, mut client_far) = duplex(1 << 16);
        let mut client = FlowConn::new(Side::Client, Box::new(client_near));
        let driver = tokio::spawn(async move { Http2Parser::replay(&ctx, &mut client).await });

        client_far.write_all(PREFACE).await.unwrap();
        let headers = Http2Frame::encode(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
            &crate::protocol::grpc::encode_trailers("request", ""),
        );
        client_far.write_all(&headers).await.unwrap();

        // read frames until the trailer HEADERS carrying grpc-status
        let mut collected = Vec::new();
        let mut scratch = [0u8; 4096];
        let (data_payload, trailer_fields) = loop {
            let n = client_far.read(&mut scratch).await.unwrap();
            assert!(n > 0, "replay closed before trailers");
            collected.extend_from_slice(&scratch[..n]);
            let mut rest = &collected[..];
            let mut data = None;
            let mut trailers = None;
            while let Some((frame, used)) = Http2Frame::parse(rest) {
                if frame.frame_type == FRAME_DATA {
                    data = Some(frame.payload.clone());
                }
                if frame.frame_type == FRAME_HEADERS && frame.is_end_stream() {
                    trailers = Some(decode_header_block(header_block(&frame)));
                }
                rest = &rest[used..];
            }
            if let (Some(data), Some(trailers)) = (data, trailers) {
                break (data, trailers);
            }
        };
        assert_eq!(data_payload, vec![0x00, 0x00, 0x00, 0x00, 0x02, b'h', b'i']);
        assert!(trailer_fields.contains(&("grpc-status".to_string(), "0".to_string())));

        drop(client_far);
        driver.await.unwrap().unwrap();
    }

    #[test]
    fn synthesized_grpc_reply_matches_wire_layout() {
        let reply = synthesize_grpc_response("0", "", b"hi");
        // find the DATA frame and check the gRPC wrapper bytes
        let mut rest = &reply[..];
        let mut data_payload = None;
        while let Some((frame, used)) = Http2Frame::parse(rest) {
            if frame.frame_type == FRAME_DATA {
                data_payload = Some(frame.payload.clone());
            }
            rest = &rest[used..];
        }
        assert_eq!(
            data_payload.unwrap(),
            vec![0x00, 0x00, 0x00, 0x00, 0x02, b'h', b'i']
        );
    }
}
