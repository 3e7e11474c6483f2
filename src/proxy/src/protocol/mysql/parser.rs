use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{Mock, MockKind, MockSpec, MessageLog, WirePayload};
use crate::protocol::mysql::basic::{looks_like_greeting, ok_packet};
use crate::protocol::mysql::command::{decode_command, CodecOptions, MySqlCommand};
use crate::protocol::mysql::constants::{CommandCode, FieldType, MAX_PAYLOAD_LEN};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{encode_packets, writers, Packet};
use crate::protocol::mysql::resultset::{decode_prepare_ok, MySqlResponse};
use crate::protocol::ParserCtx;

use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use num_traits::FromPrimitive;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const META_PHASE: &str = "phase";
pub const PHASE_HANDSHAKE: &str = "handshake";
pub const META_COMMAND: &str = "command";

/// Server-first MySQL flow driver: relays packets while capturing them
/// in RECORD, synthesizes the server side from the store in REPLAY.
pub struct MySqlParser;

/// Number of wire packets a logical payload occupies.
fn wire_packet_count(payload_len: usize) -> u8 {
    if payload_len == 0 || payload_len % MAX_PAYLOAD_LEN == 0 {
        (payload_len / MAX_PAYLOAD_LEN + 1) as u8
    } else {
        payload_len.div_ceil(MAX_PAYLOAD_LEN) as u8
    }
}

/// Re-frame a logical payload whose *last* wire packet carried `last_seq`.
fn reframe(payload: &[u8], last_seq: u8) -> Vec<u8> {
    let start = last_seq.wrapping_sub(wire_packet_count(payload.len()) - 1);
    encode_packets(payload, start)
}

async fn relay_packet(conn: &mut FlowConn, payload: &[u8], last_seq: u8) -> Result<()> {
    conn.write_all(&reframe(payload, last_seq)).await?;
    conn.flush().await?;
    Ok(())
}

struct StmtInfo {
    param_count: usize,
    param_types: Option<Vec<(FieldType, bool)>>,
}

impl MySqlParser {
    /// MySQL is detected on the *destination* side: the server speaks
    /// first, with a protocol-version-10 greeting.
    pub fn match_type(server_peek: &[u8]) -> bool {
        looks_like_greeting(server_peek)
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let opts = CodecOptions::default();
        let mut client_reader = PacketReader::new(client);
        let mut upstream_reader = PacketReader::new(upstream);

        // connection phase: greeting, handshake response and the auth
        // exchange are captured as one handshake mock
        let mut handshake = MessageLog::default();
        let (greet_seq, greeting) = match upstream_reader.next_async().await? {
            Some(p) => p,
            None => return Ok(()),
        };
        handshake
            .responses
            .push(WirePayload::from_bytes(&greeting));
        relay_packet(client_reader.r, &greeting, greet_seq).await?;

        let capabilities = loop {
            let (seq, response) = match client_reader.next_async().await? {
                Some(p) => p,
                None => return Ok(()),
            };
            handshake.requests.push(WirePayload::from_bytes(&response));
            relay_packet(upstream_reader.r, &response, seq).await?;

            let (auth_seq, auth_pkt) = match upstream_reader.next_async().await? {
                Some(p) => p,
                None => return Ok(()),
            };
            handshake
                .responses
                .push(WirePayload::from_bytes(&auth_pkt));
            relay_packet(client_reader.r, &auth_pkt, auth_seq).await?;

            if auth_pkt.is_ok_packet() {
                let caps = crate::protocol::mysql::basic::client_handshake_response(
                    &handshake.requests[0].bytes(),
                    false,
                )
                .map(|(_, h)| h.client_flag)
                .unwrap_or(CapabilityFlags::CLIENT_PROTOCOL_41);
                break caps;
            }
            if auth_pkt.is_err_packet() {
                let mock = Mock::captured(&ctx.connection_id, MockSpec::MySql(handshake))
                    .with_meta(META_PHASE, PHASE_HANDSHAKE);
                ctx.emit(mock).await;
                return Ok(());
            }
            // AuthSwitchRequest / AuthMoreData: the client answers and
            // the loop reads the server's verdict again
        };
        let mock = Mock::captured(&ctx.connection_id, MockSpec::MySql(handshake))
            .with_meta(META_PHASE, PHASE_HANDSHAKE);
        ctx.emit(mock).await;

        // command phase
        let mut stmt_registry: HashMap<u32, StmtInfo> = HashMap::new();
        loop {
            let (cmd_seq, cmd_pkt) = match client_reader.next_async().await? {
                Some(p) => p,
                None => return Ok(()),
            };
            let hint = stmt_execute_hint(&cmd_pkt, &stmt_registry);
            let decoded = decode_command(&cmd_pkt, capabilities, hint, &opts);
            relay_packet(upstream_reader.r, &cmd_pkt, cmd_seq).await?;

            let mut log = MessageLog::default();
            log.requests.push(WirePayload::from_bytes(&cmd_pkt));

            let code = CommandCode::from_u8(cmd_pkt[0]);
            let responses = match code {
                Some(CommandCode::ComQuit) => {
                    let mock = Mock::captured(&ctx.connection_id, MockSpec::MySql(log))
                        .with_meta(META_COMMAND, "ComQuit");
                    ctx.emit(mock).await;
                    return Ok(());
                }
                Some(CommandCode::ComStmtClose) | Some(CommandCode::ComStmtSendLongData) => {
                    Vec::new()
                }
                Some(CommandCode::ComStmtPrepare) => {
                    let packets =
                        relay_prepare_response(&mut upstream_reader, client_reader.r, capabilities)
                            .await?;
                    if let Ok(MySqlResponse::PrepareOk { header, .. }) =
                        decode_prepare_ok(&packets, capabilities)
                    {
                        stmt_registry.insert(
                            header.statement_id,
                            StmtInfo {
                                param_count: header.num_params as usize,
                                param_types: None,
                            },
                        );
                    }
                    packets
                }
                _ => {
                    relay_query_response(&mut upstream_reader, client_reader.r, capabilities)
                        .await?
                }
            };
            if let Ok(MySqlCommand::StmtExecute {
                statement_id,
                parameters,
                ..
            }) = &decoded
            {
                // cache the bound types; later executes may omit them
                if let Some(info) = stmt_registry.get_mut(statement_id) {
                    if info.param_types.is_none() && !parameters.is_empty() {
                        info.param_types = Some(
                            parameters
                                .iter()
                                .map(|p| (p.field_type, p.unsigned))
                                .collect(),
                        );
                    }
                }
            }

            for pkt in &responses {
                log.responses.push(WirePayload::from_bytes(pkt));
            }
            let mut mock = Mock::captured(&ctx.connection_id, MockSpec::MySql(log));
            if let Some(code) = code {
                mock = mock.with_meta(META_COMMAND, &format!("{code:?}"));
            }
            if let Ok(MySqlCommand::Query { query, .. }) = &decoded {
                mock = mock.with_meta("query", query);
            }
            ctx.emit(mock).await;
        }
    }

    pub async fn replay(ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        let store = ctx
            .session
            .mock_store
            .as_ref()
            .ok_or_else(|| ProxyError::malformed("replay", "session has no mock store"))?;

        // connection phase from the recorded handshake mock
        let handshake = store
            .get_filtered_by_kind(MockKind::MySql)
            .into_iter()
            .chain(store.get_unfiltered_by_kind(MockKind::MySql))
            .find(|m| m.metadata.get(META_PHASE).map(String::as_str) == Some(PHASE_HANDSHAKE));
        let Some(handshake) = handshake else {
            let err = ProxyError::MockNotFound {
                kind: MockKind::MySql,
                connection_id: ctx.connection_id.clone(),
            };
            ctx.report(&err).await;
            return Err(err);
        };
        let MockSpec::MySql(hs_log) = &handshake.spec else {
            return Err(ProxyError::malformed("replay", "handshake mock has wrong spec"));
        };
        let greeting = hs_log
            .responses
            .first()
            .ok_or_else(|| ProxyError::malformed("replay", "handshake mock has no greeting"))?;
        client.write_all(&encode_packets(&greeting.bytes(), 0)).await?;
        client.flush().await?;

        let mut client_reader = PacketReader::new(client);
        let (resp_seq, handshake_response) = match client_reader.next_async().await? {
            Some(p) => p,
            None => return Ok(()),
        };
        // final verdict of the recorded auth exchange, usually OK
        let verdict = hs_log
            .responses
            .last()
            .map(|p| p.bytes())
            .unwrap_or_else(|| vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        client_reader
            .r
            .write_all(&encode_packets(&verdict, resp_seq.wrapping_add(1)))
            .await?;
        client_reader.r.flush().await?;
        if let Ok((_, decoded)) =
            crate::protocol::mysql::basic::client_handshake_response(&handshake_response, false)
        {
            debug!(
                "RetraceProxy mysql replay client user={}",
                decoded.username_string()
            );
        }

        // command phase
        loop {
            let (cmd_seq, cmd_pkt) = match client_reader.next_async().await? {
                Some(p) => p,
                None => return Ok(()),
            };
            if cmd_pkt[0] == CommandCode::ComQuit as u8 {
                return Ok(());
            }

            if let Some(mock) = find_command_mock(store, &cmd_pkt) {
                let MockSpec::MySql(log) = &mock.spec else { continue };
                let mut seq = cmd_seq.wrapping_add(1);
                let mut wire = Vec::new();
                for payload in &log.responses {
                    let bytes = payload.bytes();
                    wire.extend_from_slice(&encode_packets(&bytes, seq));
                    seq = seq.wrapping_add(wire_packet_count(bytes.len()));
                }
                client_reader.r.write_all(&wire).await?;
                client_reader.r.flush().await?;
                ctx.consume(store, &mock).await;
                continue;
            }

            // pings are answered even without a recorded exchange
            if cmd_pkt[0] == CommandCode::ComPing as u8 {
                let mut writer = PacketWriter::new(&mut *client_reader.r);
                writer.set_seq(cmd_seq.wrapping_add(1));
                writers::write_ok_packet(&mut writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
                    .await?;
                writer.flush_all().await?;
                continue;
            }

            let err = ProxyError::MockNotFound {
                kind: MockKind::MySql,
                connection_id: ctx.connection_id.clone(),
            };
            ctx.report(&err).await;
            let mut writer = PacketWriter::new(&mut *client_reader.r);
            writer.set_seq(cmd_seq.wrapping_add(1));
            writers::write_err_packet(
                writers::ER_UNKNOWN_ERROR,
                b"retrace: no recorded response for this command",
                &mut writer,
            )
            .await?;
            writer.flush_all().await?;
            return Err(err);
        }
    }
}

fn stmt_execute_hint<'a>(
    cmd_pkt: &Packet,
    registry: &'a HashMap<u32, StmtInfo>,
) -> Option<(usize, Option<&'a [(FieldType, bool)]>)> {
    if cmd_pkt.first() != Some(&(CommandCode::ComStmtExecute as u8)) || cmd_pkt.len() < 5 {
        return None;
    }
    let stmt_id = u32::from_le_bytes([cmd_pkt[1], cmd_pkt[2], cmd_pkt[3], cmd_pkt[4]]);
    registry
        .get(&stmt_id)
        .map(|info| (info.param_count, info.param_types.as_deref()))
}

fn find_command_mock(store: &crate::mock::MockStore, cmd_pkt: &[u8]) -> Option<Mock> {
    let matches = |m: &Mock| {
        if m.metadata.get(META_PHASE).map(String::as_str) == Some(PHASE_HANDSHAKE) {
            return false;
        }
        match &m.spec {
            MockSpec::MySql(log) => log
                .requests
                .first()
                .map(|req| req.bytes() == cmd_pkt)
                .unwrap_or(false),
            _ => false,
        }
    };
    store
        .get_filtered_by_kind(MockKind::MySql)
        .into_iter()
        .find(|m| matches(m))
        .or_else(|| {
            store
                .get_unfiltered_by_kind(MockKind::MySql)
                .into_iter()
                .find(|m| matches(m))
        })
}

/// Relay and collect the response packets of a query-class command,
/// following the wire rules: OK and ERR end it; otherwise
/// a result set runs to its EOF (or OK-after-result-set when the
/// client deprecates EOF), repeating while more results are flagged.
async fn relay_query_response(
    upstream_reader: &mut PacketReader<&mut FlowConn>,
    client: &mut FlowConn,
    capabilities: CapabilityFlags,
) -> Result<Vec<Packet>> {
    let deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    let mut collected = Vec::new();
    loop {
        let (seq, pkt) = match upstream_reader.next_async().await? {
            Some(p) => p,
            None => return Ok(collected),
        };
        relay_packet(client, &pkt, seq).await?;
        let status = if pkt.is_ok_packet() {
            let (_, ok) = ok_packet(&pkt, capabilities)
                .map_err(|_| ProxyError::malformed("OK packet", "truncated"))?;
            collected.push(pkt);
            ok.status_flags
        } else if pkt.is_err_packet() {
            collected.push(pkt);
            return Ok(collected);
        } else {
            collected.push(pkt);
            let status =
                relay_result_rows(upstream_reader, client, deprecate_eof, &mut collected).await?;
            match status {
                Some(flags) => flags,
                None => return Ok(collected),
            }
        };
        if !status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            return Ok(collected);
        }
    }
}

/// Forward a result set body until its terminator, collecting packets.
/// Without CLIENT_DEPRECATE_EOF there are two EOFs: one closing the
/// column block, one closing the rows.
async fn relay_result_rows(
    upstream_reader: &mut PacketReader<&mut FlowConn>,
    client: &mut FlowConn,
    deprecate_eof: bool,
    collected: &mut Vec<Packet>,
) -> Result<Option<StatusFlags>> {
    let mut eof_seen = 0;
    loop {
        let (seq, pkt) = match upstream_reader.next_async().await? {
            Some(p) => p,
            None => return Ok(None),
        };
        relay_packet(client, &pkt, seq).await?;
        if pkt.is_err_packet() {
            collected.push(pkt);
            return Ok(None);
        }
        if deprecate_eof {
            if pkt.is_result_set_eof_packet() {
                let (_, ok) = ok_packet(&pkt, CapabilityFlags::CLIENT_DEPRECATE_EOF)
                    .map_err(|_| ProxyError::malformed("result set EOF", "truncated"))?;
                collected.push(pkt);
                return Ok(Some(ok.status_flags));
            }
        } else if pkt.is_eof_packet() {
            eof_seen += 1;
            if eof_seen == 2 {
                let status = crate::protocol::mysql::basic::eof_server_status(&pkt)
                    .map(|(_, s)| s)
                    .unwrap_or(StatusFlags::empty());
                collected.push(pkt);
                return Ok(Some(status));
            }
        }
        collected.push(pkt);
    }
}

/// COM_STMT_PREPARE response: header packet, then the parameter and
/// column definition blocks with their EOF terminators.
async fn relay_prepare_response(
    upstream_reader: &mut PacketReader<&mut FlowConn>,
    client: &mut FlowConn,
    capabilities: CapabilityFlags,
) -> Result<Vec<Packet>> {
    let deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    let mut collected = Vec::new();
    let (seq, head) = match upstream_reader.next_async().await? {
        Some(p) => p,
        None => return Ok(collected),
    };
    relay_packet(client, &head, seq).await?;
    if head.is_err_packet() || head.len() < 12 {
        collected.push(head);
        return Ok(collected);
    }
    let num_columns = u16::from_le_bytes([head[5], head[6]]) as usize;
    let num_params = u16::from_le_bytes([head[7], head[8]]) as usize;
    collected.push(head);

    let mut expected = num_params + num_columns;
    if !deprecate_eof {
        expected += usize::from(num_params > 0) + usize::from(num_columns > 0);
    }
    for _ in 0..expected {
        let (seq, pkt) = match upstream_reader.next_async().await? {
            Some(p) => p,
            None => break,
        };
        relay_packet(client, &pkt, seq).await?;
        collected.push(pkt);
    }
    Ok(collected)
}
