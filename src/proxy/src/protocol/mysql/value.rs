use crate::protocol::mysql::constants::FieldType;

use base64::Engine;
use serde::{Deserialize, Serialize};
use winnow::binary::{le_f32, le_f64, le_i16, le_i32, le_i64, le_i8, le_u16, le_u32, le_u64, le_u8};
use winnow::prelude::*;
use winnow::token::take;
use winnow::Parser;

use super::basic::{read_length_encoded_number, write_length_encoded_number};

/// Decoded binary-protocol value. String payloads that are not ASCII
/// are re-emitted as base64 so downstream documents stay escape-free;
/// temporal types carry their canonical string form, decoded from the
/// length-prefixed binary encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Text(String),
    /// base64 of the original bytes.
    Binary(String),
    Date(String),
    Time(String),
    DateTime(String),
}

/// One statement parameter: the two-byte type word split into its low
/// type byte and the unsigned high bit, plus the decoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub field_type: FieldType,
    pub unsigned: bool,
    pub value: Value,
}

pub fn string_value(bytes: &[u8]) -> Value {
    if bytes.iter().all(|b| b.is_ascii() && *b != 0) {
        Value::Text(String::from_utf8_lossy(bytes).into_owned())
    } else {
        Value::Binary(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

fn date_from_parts(year: u16, month: u8, day: u8) -> String {
    format!("{year:04}-{month:02}-{day:02}")
}

/// DATE/DATETIME/TIMESTAMP: a length byte of 0, 4, 7 or 11 followed by
/// that many bytes. The cursor advances by the consumed binary length;
/// the canonical string is produced from the parts.
fn decode_temporal_date(i: &[u8], ft: FieldType) -> IResult<&[u8], Value> {
    let (i, len) = le_u8.parse_peek(i)?;
    let (i, body) = take(len).parse_peek(i)?;
    let text = match len {
        0 => {
            if ft == FieldType::Date {
                "0000-00-00".to_string()
            } else {
                "0000-00-00 00:00:00".to_string()
            }
        }
        4 => {
            let year = u16::from_le_bytes([body[0], body[1]]);
            let date = date_from_parts(year, body[2], body[3]);
            if ft == FieldType::Date {
                date
            } else {
                format!("{date} 00:00:00")
            }
        }
        7 | 11 => {
            let year = u16::from_le_bytes([body[0], body[1]]);
            let date = date_from_parts(year, body[2], body[3]);
            let mut text = format!("{date} {:02}:{:02}:{:02}", body[4], body[5], body[6]);
            if len == 11 {
                let micros = u32::from_le_bytes([body[7], body[8], body[9], body[10]]);
                text.push_str(&format!(".{micros:06}"));
            }
            text
        }
        _ => {
            return Err(winnow::error::ErrMode::Cut(
                winnow::error::InputError::new(i, winnow::error::ErrorKind::Verify),
            ))
        }
    };
    let value = if ft == FieldType::Date {
        Value::Date(text)
    } else {
        Value::DateTime(text)
    };
    Ok((i, value))
}

/// TIME: a length byte of 0, 8 or 12; sign, day count and h/m/s parts.
fn decode_temporal_time(i: &[u8]) -> IResult<&[u8], Value> {
    let (i, len) = le_u8.parse_peek(i)?;
    let (i, body) = take(len).parse_peek(i)?;
    let text = match len {
        0 => "00:00:00".to_string(),
        8 | 12 => {
            let negative = body[0] == 1;
            let days = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
            let hours = days * 24 + body[5] as u32;
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                hours,
                body[6],
                body[7]
            );
            if len == 12 {
                let micros = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
                text.push_str(&format!(".{micros:06}"));
            }
            text
        }
        _ => {
            return Err(winnow::error::ErrMode::Cut(
                winnow::error::InputError::new(i, winnow::error::ErrorKind::Verify),
            ))
        }
    };
    Ok((i, Value::Time(text)))
}

/// Decode one binary-protocol value of the given type.
pub fn decode_binary_value(i: &[u8], ft: FieldType, unsigned: bool) -> IResult<&[u8], Value> {
    match ft {
        FieldType::Null => Ok((i, Value::Null)),
        FieldType::Tiny => {
            if unsigned {
                let (i, v) = le_u8.parse_peek(i)?;
                Ok((i, Value::UInt(v as u64)))
            } else {
                let (i, v) = le_i8.parse_peek(i)?;
                Ok((i, Value::Int(v as i64)))
            }
        }
        FieldType::Short | FieldType::Year => {
            if unsigned {
                let (i, v) = le_u16.parse_peek(i)?;
                Ok((i, Value::UInt(v as u64)))
            } else {
                let (i, v) = le_i16.parse_peek(i)?;
                Ok((i, Value::Int(v as i64)))
            }
        }
        FieldType::Long | FieldType::Int24 => {
            if unsigned {
                let (i, v) = le_u32.parse_peek(i)?;
                Ok((i, Value::UInt(v as u64)))
            } else {
                let (i, v) = le_i32.parse_peek(i)?;
                Ok((i, Value::Int(v as i64)))
            }
        }
        FieldType::LongLong => {
            if unsigned {
                let (i, v) = le_u64.parse_peek(i)?;
                Ok((i, Value::UInt(v)))
            } else {
                let (i, v) = le_i64.parse_peek(i)?;
                Ok((i, Value::Int(v)))
            }
        }
        FieldType::Float => {
            let (i, v) = le_f32.parse_peek(i)?;
            Ok((i, Value::Float(v)))
        }
        FieldType::Double => {
            let (i, v) = le_f64.parse_peek(i)?;
            Ok((i, Value::Double(v)))
        }
        FieldType::Date => decode_temporal_date(i, FieldType::Date),
        FieldType::DateTime | FieldType::Timestamp => decode_temporal_date(i, ft),
        FieldType::Time => decode_temporal_time(i),
        // every remaining family is length-encoded on the wire
        FieldType::Decimal
        | FieldType::NewDecimal
        | FieldType::VarChar
        | FieldType::VarString
        | FieldType::String
        | FieldType::Enum
        | FieldType::Set
        | FieldType::Bit
        | FieldType::Json
        | FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::Geometry => {
            let (i, len) = read_length_encoded_number(i)?;
            let (i, body) = take(len).parse_peek(i)?;
            Ok((i, string_value(body)))
        }
    }
}

/// Re-encode a decoded value back to binary-protocol bytes.
pub fn encode_binary_value(param: &Parameter, out: &mut Vec<u8>) {
    match (&param.value, param.field_type) {
        (Value::Null, _) => {}
        (Value::Int(v), FieldType::Tiny) => out.push(*v as u8),
        (Value::UInt(v), FieldType::Tiny) => out.push(*v as u8),
        (Value::Int(v), FieldType::Short | FieldType::Year) => {
            out.extend_from_slice(&(*v as i16).to_le_bytes())
        }
        (Value::UInt(v), FieldType::Short | FieldType::Year) => {
            out.extend_from_slice(&(*v as u16).to_le_bytes())
        }
        (Value::Int(v), FieldType::Long | FieldType::Int24) => {
            out.extend_from_slice(&(*v as i32).to_le_bytes())
        }
        (Value::UInt(v), FieldType::Long | FieldType::Int24) => {
            out.extend_from_slice(&(*v as u32).to_le_bytes())
        }
        (Value::Int(v), FieldType::LongLong) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::UInt(v), FieldType::LongLong) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::Float(v), _) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::Double(v), _) => out.extend_from_slice(&v.to_le_bytes()),
        (Value::Date(text), _) => encode_temporal_date(text, out),
        (Value::DateTime(text), _) => encode_temporal_date(text, out),
        (Value::Time(text), _) => encode_temporal_time(text, out),
        (Value::Text(text), _) => {
            write_length_encoded_number(text.len() as u64, out);
            out.extend_from_slice(text.as_bytes());
        }
        (Value::Binary(b64), _) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .unwrap_or_default();
            write_length_encoded_number(bytes.len() as u64, out);
            out.extend_from_slice(&bytes);
        }
        // mismatched tag/type pairs fall back to a lenenc dump of the
        // debug form rather than corrupting the stream silently
        (other, _) => {
            let text = format!("{other:?}");
            write_length_encoded_number(text.len() as u64, out);
            out.extend_from_slice(text.as_bytes());
        }
    }
}

fn encode_temporal_date(text: &str, out: &mut Vec<u8>) {
    let (date_part, time_part) = match text.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };
    let mut ymd = date_part.splitn(3, '-');
    let year: u16 = ymd.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let month: u8 = ymd.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let day: u8 = ymd.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    match time_part {
        None => {
            out.push(4);
            out.extend_from_slice(&year.to_le_bytes());
            out.push(month);
            out.push(day);
        }
        Some(t) => {
            let (hms, micros) = match t.split_once('.') {
                Some((hms, frac)) => (hms, frac.parse::<u32>().unwrap_or(0)),
                None => (t, 0),
            };
            let mut parts = hms.splitn(3, ':');
            let hour: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let minute: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let second: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            out.push(if micros > 0 { 11 } else { 7 });
            out.extend_from_slice(&year.to_le_bytes());
            out.push(month);
            out.push(day);
            out.push(hour);
            out.push(minute);
            out.push(second);
            if micros > 0 {
                out.extend_from_slice(&micros.to_le_bytes());
            }
        }
    }
}

fn encode_temporal_time(text: &str, out: &mut Vec<u8>) {
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (1u8, rest),
        None => (0u8, text),
    };
    let (hms, micros) = match text.split_once('.') {
        Some((hms, frac)) => (hms, frac.parse::<u32>().unwrap_or(0)),
        None => (text, 0),
    };
    let mut parts = hms.splitn(3, ':');
    let total_hours: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minute: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let second: u8 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let days = total_hours / 24;
    let hour = (total_hours % 24) as u8;
    out.push(if micros > 0 { 12 } else { 8 });
    out.push(negative);
    out.extend_from_slice(&days.to_le_bytes());
    out.push(hour);
    out.push(minute);
    out.push(second);
    if micros > 0 {
        out.extend_from_slice(&micros.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_long_value() {
        // 0xD2 0x02 0x96 0x49 little-endian == 1234567890
        let bytes = [0xd2, 0x02, 0x96, 0x49];
        let (rest, v) = decode_binary_value(&bytes, FieldType::Long, true).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, Value::UInt(1234567890));
    }

    #[test]
    fn signed_tiny_value() {
        let (_, v) = decode_binary_value(&[0xff], FieldType::Tiny, false).unwrap();
        assert_eq!(v, Value::Int(-1));
        let (_, v) = decode_binary_value(&[0xff], FieldType::Tiny, true).unwrap();
        assert_eq!(v, Value::UInt(255));
    }

    #[test]
    fn datetime_binary_advance_is_binary_length() {
        // len=7: 2023-11-07 16:45:01, one trailing byte must survive
        let bytes = [0x07, 0xe7, 0x07, 0x0b, 0x07, 0x10, 0x2d, 0x01, 0xAA];
        let (rest, v) = decode_binary_value(&bytes, FieldType::DateTime, false).unwrap();
        assert_eq!(rest, &[0xAA]);
        assert_eq!(v, Value::DateTime("2023-11-07 16:45:01".to_string()));
    }

    #[test]
    fn date_roundtrip() {
        let bytes = [0x04, 0xe7, 0x07, 0x0b, 0x07];
        let (_, v) = decode_binary_value(&bytes, FieldType::Date, false).unwrap();
        assert_eq!(v, Value::Date("2023-11-07".to_string()));
        let param = Parameter {
            field_type: FieldType::Date,
            unsigned: false,
            value: v,
        };
        let mut out = Vec::new();
        encode_binary_value(&param, &mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn negative_time_with_micros() {
        let mut bytes = vec![0x0c, 0x01];
        bytes.extend_from_slice(&1u32.to_le_bytes()); // 1 day
        bytes.extend_from_slice(&[2, 3, 4]); // 02:03:04
        bytes.extend_from_slice(&500000u32.to_le_bytes());
        let (_, v) = decode_binary_value(&bytes, FieldType::Time, false).unwrap();
        assert_eq!(v, Value::Time("-26:03:04.500000".to_string()));

        let param = Parameter {
            field_type: FieldType::Time,
            unsigned: false,
            value: v,
        };
        let mut out = Vec::new();
        encode_binary_value(&param, &mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn string_values_split_on_ascii() {
        let (_, v) = decode_binary_value(&[0x02, b'h', b'i'], FieldType::VarString, false).unwrap();
        assert_eq!(v, Value::Text("hi".to_string()));

        let (_, v) = decode_binary_value(&[0x02, 0xc3, 0xa9], FieldType::Blob, false).unwrap();
        match v {
            Value::Binary(b64) => {
                assert_eq!(
                    base64::engine::general_purpose::STANDARD.decode(b64).unwrap(),
                    vec![0xc3, 0xa9]
                );
            }
            other => panic!("expected base64 value, got {other:?}"),
        }
    }

    #[test]
    fn numeric_roundtrips() {
        for (param, wire) in [
            (
                Parameter {
                    field_type: FieldType::LongLong,
                    unsigned: true,
                    value: Value::UInt(u64::MAX),
                },
                vec![0xff; 8],
            ),
            (
                Parameter {
                    field_type: FieldType::Short,
                    unsigned: false,
                    value: Value::Int(-2),
                },
                vec![0xfe, 0xff],
            ),
        ] {
            let mut out = Vec::new();
            encode_binary_value(&param, &mut out);
            assert_eq!(out, wire);
            let (_, back) =
                decode_binary_value(&out, param.field_type, param.unsigned).unwrap();
            assert_eq!(back, param.value);
        }
    }
}
