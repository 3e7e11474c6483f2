use crate::error::{ProxyError, Result};
use crate::protocol::mysql::basic::{ok_packet, read_length_encoded_number, OkPacket};
use crate::protocol::mysql::constants::FieldType;
use crate::protocol::mysql::packet::Packet;
use crate::protocol::mysql::value::{decode_binary_value, string_value, Value};

use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use winnow::prelude::*;
use winnow::token::take;
use winnow::Parser;

const NULL_MARKER: u8 = 0xfb;
const UNSIGNED_COLUMN_FLAG: u16 = 0x20;

/// ColumnDefinition41.
/// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query_response_text_resultset_column_definition.html
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_COLUMN_FLAG != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrPacket {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// A fully decoded server response to one command.
#[derive(Debug, Clone, PartialEq)]
pub enum MySqlResponse {
    Ok(OkPacket),
    Err(ErrPacket),
    ResultSet {
        columns: Vec<ColumnDefinition>,
        rows: Vec<Vec<Value>>,
        binary: bool,
    },
    PrepareOk {
        header: PrepareOk,
        params: Vec<ColumnDefinition>,
        columns: Vec<ColumnDefinition>,
    },
}

fn lenenc_str(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(i)
}

pub fn decode_err_packet(payload: &[u8]) -> Result<ErrPacket> {
    if payload.len() < 9 || payload[0] != 0xff {
        return Err(ProxyError::malformed("ERR packet", "bad header"));
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    let (sqlstate, message) = if payload[3] == b'#' {
        (
            String::from_utf8_lossy(&payload[4..9]).into_owned(),
            String::from_utf8_lossy(&payload[9..]).into_owned(),
        )
    } else {
        (
            String::new(),
            String::from_utf8_lossy(&payload[3..]).into_owned(),
        )
    };
    Ok(ErrPacket {
        code,
        sqlstate,
        message,
    })
}

pub fn decode_column(payload: &[u8]) -> Result<ColumnDefinition> {
    let err = |_| ProxyError::malformed("column definition", "truncated");
    let i = payload;
    let (i, _catalog) = lenenc_str(i).map_err(err)?;
    let (i, schema) = lenenc_str(i).map_err(err)?;
    let (i, table) = lenenc_str(i).map_err(err)?;
    let (i, _org_table) = lenenc_str(i).map_err(err)?;
    let (i, name) = lenenc_str(i).map_err(err)?;
    let (i, _org_name) = lenenc_str(i).map_err(err)?;
    let (i, _fixed_len) = read_length_encoded_number(i).map_err(err)?;
    if i.len() < 10 {
        return Err(ProxyError::malformed("column definition", "short tail"));
    }
    let charset = u16::from_le_bytes([i[0], i[1]]);
    let column_length = u32::from_le_bytes([i[2], i[3], i[4], i[5]]);
    let column_type = FieldType::from_u8(i[6]).ok_or(ProxyError::Unsupported {
        field: "column type",
        value: i[6] as u64,
    })?;
    let flags = u16::from_le_bytes([i[7], i[8]]);
    let decimals = i[9];
    Ok(ColumnDefinition {
        schema: String::from_utf8_lossy(schema).into_owned(),
        table: String::from_utf8_lossy(table).into_owned(),
        name: String::from_utf8_lossy(name).into_owned(),
        charset,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

pub fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let mut i = payload;
    let mut row = Vec::with_capacity(columns.len());
    for _ in columns {
        if i.first() == Some(&NULL_MARKER) {
            i = &i[1..];
            row.push(Value::Null);
            continue;
        }
        let (rest, bytes) =
            lenenc_str(i).map_err(|_| ProxyError::malformed("text row", "truncated cell"))?;
        i = rest;
        row.push(string_value(bytes));
    }
    Ok(row)
}

/// Binary rows: 0x00 header, then a null bitmap with a 2-bit offset,
/// then the values of the non-NULL columns.
pub fn decode_binary_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    if payload.first() != Some(&0x00) {
        return Err(ProxyError::malformed("binary row", "bad header"));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    if payload.len() < 1 + bitmap_len {
        return Err(ProxyError::malformed("binary row", "short null bitmap"));
    }
    let bitmap = &payload[1..1 + bitmap_len];
    let mut i = &payload[1 + bitmap_len..];
    let mut row = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        let bit = idx + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            row.push(Value::Null);
            continue;
        }
        let (rest, value) = decode_binary_value(i, col.column_type, col.is_unsigned())
            .map_err(|_| ProxyError::malformed("binary row", format!("bad cell {idx}")))?;
        i = rest;
        row.push(value);
    }
    Ok(row)
}

/// Decode a full command response from its packet sequence: an OK, an
/// ERR, or a result set (text or binary).
pub fn decode_response(
    packets: &[Packet],
    capabilities: CapabilityFlags,
    binary: bool,
) -> Result<MySqlResponse> {
    let first = packets
        .first()
        .ok_or(ProxyError::ShortBuffer { needed: 1 })?;
    if first.is_err_packet() {
        return Ok(MySqlResponse::Err(decode_err_packet(first)?));
    }
    if first.is_ok_packet() {
        let (_, ok) = ok_packet(first, capabilities)
            .map_err(|_| ProxyError::malformed("OK packet", "truncated"))?;
        return Ok(MySqlResponse::Ok(ok));
    }

    let (_, column_count) = read_length_encoded_number(first)
        .map_err(|_| ProxyError::malformed("result set", "bad column count"))?;
    let column_count = column_count as usize;
    let deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);

    let mut idx = 1;
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let pkt = packets
            .get(idx)
            .ok_or(ProxyError::ShortBuffer { needed: 1 })?;
        columns.push(decode_column(pkt)?);
        idx += 1;
    }
    if !deprecate_eof {
        // EOF packet closes the column block
        idx += 1;
    }

    let mut rows = Vec::new();
    while let Some(pkt) = packets.get(idx) {
        if pkt.is_eof_packet() || pkt.is_result_set_eof_packet() || pkt.is_err_packet() {
            break;
        }
        let row = if binary {
            decode_binary_row(pkt, &columns)?
        } else {
            decode_text_row(pkt, &columns)?
        };
        rows.push(row);
        idx += 1;
    }

    Ok(MySqlResponse::ResultSet {
        columns,
        rows,
        binary,
    })
}

/// COM_STMT_PREPARE_OK followed by the parameter and column definition
/// blocks.
pub fn decode_prepare_ok(
    packets: &[Packet],
    capabilities: CapabilityFlags,
) -> Result<MySqlResponse> {
    let first = packets
        .first()
        .ok_or(ProxyError::ShortBuffer { needed: 1 })?;
    if first.is_err_packet() {
        return Ok(MySqlResponse::Err(decode_err_packet(first)?));
    }
    if first.len() < 12 || first[0] != 0x00 {
        return Err(ProxyError::malformed("COM_STMT_PREPARE_OK", "bad header"));
    }
    let header = PrepareOk {
        statement_id: u32::from_le_bytes([first[1], first[2], first[3], first[4]]),
        num_columns: u16::from_le_bytes([first[5], first[6]]),
        num_params: u16::from_le_bytes([first[7], first[8]]),
        warnings: u16::from_le_bytes([first[10], first[11]]),
    };
    let deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);

    let mut idx = 1;
    let mut params = Vec::with_capacity(header.num_params as usize);
    for _ in 0..header.num_params {
        let pkt = packets
            .get(idx)
            .ok_or(ProxyError::ShortBuffer { needed: 1 })?;
        params.push(decode_column(pkt)?);
        idx += 1;
    }
    if header.num_params > 0 && !deprecate_eof {
        idx += 1;
    }
    let mut columns = Vec::with_capacity(header.num_columns as usize);
    for _ in 0..header.num_columns {
        let pkt = packets
            .get(idx)
            .ok_or(ProxyError::ShortBuffer { needed: 1 })?;
        columns.push(decode_column(pkt)?);
        idx += 1;
    }
    Ok(MySqlResponse::PrepareOk {
        header,
        params,
        columns,
    })
}
