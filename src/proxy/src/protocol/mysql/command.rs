use crate::error::{ProxyError, Result};
use crate::protocol::mysql::basic::{
    read_length_encoded_number, write_length_encoded_number,
};
use crate::protocol::mysql::constants::{CommandCode, FieldType, PARAM_UNSIGNED_FLAG};
use crate::protocol::mysql::value::{
    decode_binary_value, encode_binary_value, string_value, Parameter, Value,
};

use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Decoder knobs that are persister concerns rather than protocol
/// concerns.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// Replace tabs in SQL text with four spaces so the document
    /// persister needs no escaping.
    pub normalize_tabs: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            normalize_tabs: true,
        }
    }
}

fn sql_text(bytes: &[u8], opts: &CodecOptions) -> String {
    let text = String::from_utf8_lossy(bytes).into_owned();
    if opts.normalize_tabs {
        text.replace('\t', "    ")
    } else {
        text
    }
}

/// A decoded client command packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MySqlCommand {
    Query {
        query: String,
        parameters: Vec<Parameter>,
    },
    StmtPrepare {
        query: String,
    },
    StmtExecute {
        statement_id: u32,
        flags: u8,
        iteration_count: u32,
        parameters: Vec<Parameter>,
    },
    StmtFetch {
        statement_id: u32,
        rows: u32,
    },
    StmtReset {
        statement_id: u32,
    },
    StmtClose {
        statement_id: u32,
    },
    StmtSendLongData {
        statement_id: u32,
        param_index: u16,
        payload: Value,
    },
    Quit,
    InitDb {
        schema: String,
    },
    Statistics,
    Debug,
    Ping,
    ChangeUser {
        username: String,
    },
    ResetConnection,
    Other {
        code: u8,
        payload: Value,
    },
}

fn short(needed: usize) -> ProxyError {
    ProxyError::ShortBuffer { needed }
}

fn take_bytes<'a>(i: &'a [u8], n: usize, what: &'static str) -> Result<(&'a [u8], &'a [u8])> {
    if i.len() < n {
        return Err(ProxyError::malformed(what, format!("need {n} bytes, have {}", i.len())));
    }
    Ok((&i[n..], &i[..n]))
}

fn lenenc<'a>(i: &'a [u8], what: &'static str) -> Result<(&'a [u8], u64)> {
    read_length_encoded_number(i)
        .map(|(rest, v)| (rest, v))
        .map_err(|_| ProxyError::malformed(what, "bad length-encoded integer"))
}

/// Parameter block shared by COM_QUERY attributes and COM_STMT_EXECUTE:
/// null bitmap of ceil(n/8) bytes, a new-params-bind flag, the type
/// words when the flag is 1, then the values of the non-NULL params.
fn decode_parameter_block<'a>(
    i: &'a [u8],
    param_count: usize,
    known_types: Option<&[(FieldType, bool)]>,
    what: &'static str,
) -> Result<(&'a [u8], Vec<Parameter>)> {
    let bitmap_len = param_count.div_ceil(8);
    let (i, bitmap) = take_bytes(i, bitmap_len, what)?;
    let (mut i, flag) = take_bytes(i, 1, what)?;
    let new_params_bound = flag[0] == 1;
    if !new_params_bound && param_count > 0 && known_types.is_none() {
        // the flag MUST be 1 when parameters are present; a zero
        // parameter count tolerates any value
        return Err(ProxyError::malformed(
            what,
            format!("new-params-bind-flag must be 1, got {}", flag[0]),
        ));
    }

    let mut types: Vec<(FieldType, bool)> = Vec::with_capacity(param_count);
    if new_params_bound {
        for _ in 0..param_count {
            let (rest, word) = take_bytes(i, 2, what)?;
            i = rest;
            let ft = FieldType::from_u8(word[0]).ok_or(ProxyError::Unsupported {
                field: "parameter type",
                value: word[0] as u64,
            })?;
            let unsigned = word[1] & PARAM_UNSIGNED_FLAG != 0;
            types.push((ft, unsigned));
        }
    } else if let Some(cached) = known_types {
        types.extend_from_slice(cached);
    }

    let mut parameters = Vec::with_capacity(param_count);
    for idx in 0..param_count {
        let is_null = bitmap[idx / 8] & (1 << (idx % 8)) != 0;
        let (ft, unsigned) = types.get(idx).copied().unwrap_or((FieldType::Null, false));
        if is_null || ft == FieldType::Null {
            parameters.push(Parameter {
                field_type: ft,
                unsigned,
                value: Value::Null,
            });
            continue;
        }
        let (rest, value) = decode_binary_value(i, ft, unsigned)
            .map_err(|_| ProxyError::malformed(what, format!("bad value for param {idx}")))?;
        i = rest;
        parameters.push(Parameter {
            field_type: ft,
            unsigned,
            value,
        });
    }
    Ok((i, parameters))
}

/// Decode one client command packet. `stmt_param_hint` supplies the
/// parameter count (and cached types) of the prepared statement a
/// COM_STMT_EXECUTE refers to; the wire itself does not carry it.
pub fn decode_command(
    payload: &[u8],
    capabilities: CapabilityFlags,
    stmt_param_hint: Option<(usize, Option<&[(FieldType, bool)]>)>,
    opts: &CodecOptions,
) -> Result<MySqlCommand> {
    if payload.is_empty() {
        return Err(short(1));
    }
    let code = CommandCode::from_u8(payload[0]).ok_or(ProxyError::Unsupported {
        field: "command",
        value: payload[0] as u64,
    })?;
    let i = &payload[1..];

    let cmd = match code {
        CommandCode::ComQuery => {
            if capabilities.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
                let (i, param_count) = lenenc(i, "COM_QUERY")?;
                let (i, _param_set_count) = lenenc(i, "COM_QUERY")?;
                let (i, parameters) =
                    decode_parameter_block(i, param_count as usize, None, "COM_QUERY")?;
                MySqlCommand::Query {
                    query: sql_text(i, opts),
                    parameters,
                }
            } else {
                MySqlCommand::Query {
                    query: sql_text(i, opts),
                    parameters: vec![],
                }
            }
        }
        CommandCode::ComStmtPrepare => MySqlCommand::StmtPrepare {
            query: sql_text(i, opts),
        },
        CommandCode::ComStmtExecute => {
            let (i, id_bytes) = take_bytes(i, 4, "COM_STMT_EXECUTE")?;
            let statement_id = u32::from_le_bytes(id_bytes.try_into().unwrap());
            let (i, flag_bytes) = take_bytes(i, 1, "COM_STMT_EXECUTE")?;
            let (i, iter_bytes) = take_bytes(i, 4, "COM_STMT_EXECUTE")?;
            let iteration_count = u32::from_le_bytes(iter_bytes.try_into().unwrap());
            let (param_count, known_types) = stmt_param_hint.unwrap_or((0, None));
            let parameters = if param_count > 0 {
                let (_, parameters) =
                    decode_parameter_block(i, param_count, known_types, "COM_STMT_EXECUTE")?;
                parameters
            } else {
                vec![]
            };
            MySqlCommand::StmtExecute {
                statement_id,
                flags: flag_bytes[0],
                iteration_count,
                parameters,
            }
        }
        CommandCode::ComStmtFetch => {
            let (i, id_bytes) = take_bytes(i, 4, "COM_STMT_FETCH")?;
            let (_, rows_bytes) = take_bytes(i, 4, "COM_STMT_FETCH")?;
            MySqlCommand::StmtFetch {
                statement_id: u32::from_le_bytes(id_bytes.try_into().unwrap()),
                rows: u32::from_le_bytes(rows_bytes.try_into().unwrap()),
            }
        }
        CommandCode::ComStmtReset => {
            let (_, id_bytes) = take_bytes(i, 4, "COM_STMT_RESET")?;
            MySqlCommand::StmtReset {
                statement_id: u32::from_le_bytes(id_bytes.try_into().unwrap()),
            }
        }
        CommandCode::ComStmtClose => {
            let (_, id_bytes) = take_bytes(i, 4, "COM_STMT_CLOSE")?;
            MySqlCommand::StmtClose {
                statement_id: u32::from_le_bytes(id_bytes.try_into().unwrap()),
            }
        }
        CommandCode::ComStmtSendLongData => {
            let (i, id_bytes) = take_bytes(i, 4, "COM_STMT_SEND_LONG_DATA")?;
            let (i, param_bytes) = take_bytes(i, 2, "COM_STMT_SEND_LONG_DATA")?;
            MySqlCommand::StmtSendLongData {
                statement_id: u32::from_le_bytes(id_bytes.try_into().unwrap()),
                param_index: u16::from_le_bytes(param_bytes.try_into().unwrap()),
                payload: string_value(i),
            }
        }
        CommandCode::ComQuit => MySqlCommand::Quit,
        CommandCode::ComInitDB => MySqlCommand::InitDb {
            schema: String::from_utf8_lossy(i).into_owned(),
        },
        CommandCode::ComStatistics => MySqlCommand::Statistics,
        CommandCode::ComDebug => MySqlCommand::Debug,
        CommandCode::ComPing => MySqlCommand::Ping,
        CommandCode::ComChangeUser => {
            let end = i.iter().position(|b| *b == 0).unwrap_or(i.len());
            MySqlCommand::ChangeUser {
                username: String::from_utf8_lossy(&i[..end]).into_owned(),
            }
        }
        CommandCode::ComResetConnection => MySqlCommand::ResetConnection,
        _ => MySqlCommand::Other {
            code: payload[0],
            payload: string_value(i),
        },
    };
    Ok(cmd)
}

/// Re-encode a decoded command to its packet payload. The byte ranges
/// we own round-trip; `Other` replays its captured payload verbatim.
pub fn encode_command(cmd: &MySqlCommand, capabilities: CapabilityFlags) -> Vec<u8> {
    let mut out = Vec::new();
    match cmd {
        MySqlCommand::Query { query, parameters } => {
            out.push(CommandCode::ComQuery as u8);
            if capabilities.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES) {
                write_length_encoded_number(parameters.len() as u64, &mut out);
                write_length_encoded_number(1, &mut out);
                encode_parameter_block(parameters, &mut out);
            }
            out.extend_from_slice(query.as_bytes());
        }
        MySqlCommand::StmtPrepare { query } => {
            out.push(CommandCode::ComStmtPrepare as u8);
            out.extend_from_slice(query.as_bytes());
        }
        MySqlCommand::StmtExecute {
            statement_id,
            flags,
            iteration_count,
            parameters,
        } => {
            out.push(CommandCode::ComStmtExecute as u8);
            out.extend_from_slice(&statement_id.to_le_bytes());
            out.push(*flags);
            out.extend_from_slice(&iteration_count.to_le_bytes());
            if !parameters.is_empty() {
                encode_parameter_block(parameters, &mut out);
            }
        }
        MySqlCommand::StmtFetch { statement_id, rows } => {
            out.push(CommandCode::ComStmtFetch as u8);
            out.extend_from_slice(&statement_id.to_le_bytes());
            out.extend_from_slice(&rows.to_le_bytes());
        }
        MySqlCommand::StmtReset { statement_id } => {
            out.push(CommandCode::ComStmtReset as u8);
            out.extend_from_slice(&statement_id.to_le_bytes());
        }
        MySqlCommand::StmtClose { statement_id } => {
            out.push(CommandCode::ComStmtClose as u8);
            out.extend_from_slice(&statement_id.to_le_bytes());
        }
        MySqlCommand::StmtSendLongData {
            statement_id,
            param_index,
            payload,
        } => {
            out.push(CommandCode::ComStmtSendLongData as u8);
            out.extend_from_slice(&statement_id.to_le_bytes());
            out.extend_from_slice(&param_index.to_le_bytes());
            extend_raw_value(payload, &mut out);
        }
        MySqlCommand::Quit => out.push(CommandCode::ComQuit as u8),
        MySqlCommand::InitDb { schema } => {
            out.push(CommandCode::ComInitDB as u8);
            out.extend_from_slice(schema.as_bytes());
        }
        MySqlCommand::Statistics => out.push(CommandCode::ComStatistics as u8),
        MySqlCommand::Debug => out.push(CommandCode::ComDebug as u8),
        MySqlCommand::Ping => out.push(CommandCode::ComPing as u8),
        MySqlCommand::ChangeUser { username } => {
            out.push(CommandCode::ComChangeUser as u8);
            out.extend_from_slice(username.as_bytes());
            out.push(0);
        }
        MySqlCommand::ResetConnection => out.push(CommandCode::ComResetConnection as u8),
        MySqlCommand::Other { code, payload } => {
            out.push(*code);
            extend_raw_value(payload, &mut out);
        }
    }
    out
}

fn extend_raw_value(value: &Value, out: &mut Vec<u8>) {
    use base64::Engine;
    match value {
        Value::Text(text) => out.extend_from_slice(text.as_bytes()),
        Value::Binary(b64) => out.extend_from_slice(
            &base64::engine::general_purpose::STANDARD
                .decode(b64)
                .unwrap_or_default(),
        ),
        _ => {}
    }
}

fn encode_parameter_block(parameters: &[Parameter], out: &mut Vec<u8>) {
    let bitmap_len = parameters.len().div_ceil(8);
    let mut bitmap = vec![0u8; bitmap_len];
    for (idx, p) in parameters.iter().enumerate() {
        if p.value == Value::Null {
            bitmap[idx / 8] |= 1 << (idx % 8);
        }
    }
    out.extend_from_slice(&bitmap);
    out.push(1); // new-params-bind-flag
    for p in parameters {
        out.push(p.field_type as u8);
        out.push(if p.unsigned { PARAM_UNSIGNED_FLAG } else { 0 });
    }
    for p in parameters {
        if p.value != Value::Null {
            encode_binary_value(p, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr_caps() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
    }

    #[test]
    fn query_with_unsigned_long_attribute() {
        // 0x03, lenenc 1 param, lenenc 1 set, bitmap 0x00, bind flag 1,
        // type LONG|unsigned, value 1234567890 LE, then the query text
        let payload = [
            0x03, 0x01, 0x01, 0x00, 0x01, 0x03, 0x80, 0xd2, 0x02, 0x96, 0x49, b'S', b'E', b'L',
            b'E', b'C', b'T', b' ', b'?',
        ];
        let cmd = decode_command(&payload, attr_caps(), None, &CodecOptions::default()).unwrap();
        match cmd {
            MySqlCommand::Query { query, parameters } => {
                assert_eq!(query, "SELECT ?");
                assert_eq!(parameters.len(), 1);
                assert_eq!(parameters[0].field_type, FieldType::Long);
                assert!(parameters[0].unsigned);
                assert_eq!(parameters[0].value, Value::UInt(1234567890));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn query_attribute_roundtrip() {
        let payload = [
            0x03, 0x01, 0x01, 0x00, 0x01, 0x03, 0x80, 0xd2, 0x02, 0x96, 0x49, b'S', b'E', b'L',
            b'E', b'C', b'T', b' ', b'?',
        ];
        let opts = CodecOptions {
            normalize_tabs: false,
        };
        let cmd = decode_command(&payload, attr_caps(), None, &opts).unwrap();
        assert_eq!(encode_command(&cmd, attr_caps()), payload);
    }

    #[test]
    fn bad_bind_flag_with_params_is_malformed() {
        let payload = [0x03, 0x01, 0x01, 0x00, 0x02, 0x03, 0x80, 0x00, 0x00, 0x00, 0x00];
        let err = decode_command(&payload, attr_caps(), None, &CodecOptions::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Malformed { .. }));
    }

    #[test]
    fn bad_bind_flag_without_params_is_tolerated() {
        let payload = [0x03, 0x00, 0x01, 0x02, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1'];
        let cmd = decode_command(&payload, attr_caps(), None, &CodecOptions::default()).unwrap();
        match cmd {
            MySqlCommand::Query { query, parameters } => {
                assert_eq!(query, "SELECT 1");
                assert!(parameters.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tabs_normalize_to_four_spaces() {
        let payload = [0x03, b'S', b'E', b'L', b'\t', b'1'];
        let cmd = decode_command(
            &payload,
            CapabilityFlags::CLIENT_PROTOCOL_41,
            None,
            &CodecOptions::default(),
        )
        .unwrap();
        match cmd {
            MySqlCommand::Query { query, .. } => assert_eq!(query, "SEL    1"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn stmt_execute_with_null_bitmap() {
        // two params, second is NULL
        let mut payload = vec![0x17];
        payload.extend_from_slice(&5u32.to_le_bytes()); // stmt id
        payload.push(0x00); // flags
        payload.extend_from_slice(&1u32.to_le_bytes()); // iterations
        payload.push(0b0000_0010); // null bitmap: param 1 null
        payload.push(0x01); // new params bound
        payload.extend_from_slice(&[0x08, 0x00]); // LONGLONG signed
        payload.extend_from_slice(&[0x06, 0x00]); // NULL type
        payload.extend_from_slice(&(-7i64).to_le_bytes());

        let cmd = decode_command(
            &payload,
            CapabilityFlags::CLIENT_PROTOCOL_41,
            Some((2, None)),
            &CodecOptions::default(),
        )
        .unwrap();
        match cmd {
            MySqlCommand::StmtExecute {
                statement_id,
                parameters,
                ..
            } => {
                assert_eq!(statement_id, 5);
                assert_eq!(parameters[0].value, Value::Int(-7));
                assert_eq!(parameters[1].value, Value::Null);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn stmt_close_and_utility_commands() {
        let mut close = vec![0x19];
        close.extend_from_slice(&3u32.to_le_bytes());
        let cmd = decode_command(
            &close,
            CapabilityFlags::empty(),
            None,
            &CodecOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, MySqlCommand::StmtClose { statement_id: 3 });
        assert_eq!(encode_command(&cmd, CapabilityFlags::empty()), close);

        for (byte, expect) in [
            (0x01u8, MySqlCommand::Quit),
            (0x0e, MySqlCommand::Ping),
            (0x09, MySqlCommand::Statistics),
            (0x0d, MySqlCommand::Debug),
            (0x1f, MySqlCommand::ResetConnection),
        ] {
            let cmd = decode_command(
                &[byte],
                CapabilityFlags::empty(),
                None,
                &CodecOptions::default(),
            )
            .unwrap();
            assert_eq!(cmd, expect);
        }
    }
}
