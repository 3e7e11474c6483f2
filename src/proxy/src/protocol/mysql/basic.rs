use crate::protocol::mysql::constants::GREETING_PROTOCOL_VERSION;

use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::Parser;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

/// `HandshakeResponse` represents the client's reply to the server
/// greeting (HandshakeResponse41 when CLIENT_PROTOCOL_41 is set).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<HashMap<String, String>>,
}

impl HandshakeResponse {
    pub fn username_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }
}

/// The server's first packet on the wire: protocol version 10 greeting.
/// [Initial Handshake](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase.html)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub server_version: Vec<u8>,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub collation: u8,
    pub status_flags: StatusFlags,
    pub auth_plugin: Vec<u8>,
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

/// Serialize a length-encoded integer, the 1/3/4/9-byte forms.
pub fn write_length_encoded_number(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xfa => out.push(value as u8),
        0xfb..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            ("".to_string(), "".to_string())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

/// Decode the server greeting. The proxy only needs enough of it to
/// recognize the flow as server-first MySQL and to capture the packet.
pub fn server_greeting(i: &[u8]) -> IResult<&[u8], ServerGreeting> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, server_version) = take_until(1.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, connection_id) = le_u32.parse_peek(i)?;
    let (i, _auth_data_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, cap_low) = le_u16.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    let (i, cap_high) = le_u16.parse_peek(i)?;
    let capabilities =
        CapabilityFlags::from_bits_truncate(((cap_high as u32) << 16) | cap_low as u32);
    let (i, _auth_data_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;
    // part-2 of the auth plugin data, 13 bytes when secure connection
    let (i, _auth_data_2) =
        if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) && i.len() >= 13 {
            take(13u8).parse_peek(i)?
        } else {
            (i, &b""[..])
        };
    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, plugin) = take_until(0.., "\0").parse_peek(i)?;
            (i, plugin)
        } else {
            (i, &b""[..])
        };

    Ok((
        i,
        ServerGreeting {
            protocol_version,
            server_version: server_version.to_vec(),
            connection_id,
            capabilities,
            collation,
            status_flags: StatusFlags::from_bits_truncate(status),
            auth_plugin: auth_plugin.to_vec(),
        },
    ))
}

/// The greeting starts with protocol version 0x0a; that one byte is
/// what server-first detection keys on.
pub fn looks_like_greeting(peek: &[u8]) -> bool {
    !peek.is_empty() && peek[0] == GREETING_PROTOCOL_VERSION
}

pub fn client_handshake_response(
    i: &[u8],
    is_after_tls: bool,
) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;
        return Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: i.to_vec(),
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ));
    }

    // HandshakeResponse41
    let (i, cap2) = le_u16.parse_peek(i)?;
    let cap = (cap2 as u32) << 16 | capability_flags as u32;
    capabilities = CapabilityFlags::from_bits_truncate(cap);

    let (i, max_packet_len) = le_u32.parse_peek(i)?;
    let (i, collation) = take(1u8).parse_peek(i)?;
    let (i, _) = take(23u8).parse_peek(i)?;

    if !is_after_tls && capabilities.contains(CapabilityFlags::CLIENT_SSL) {
        // SSLRequest stops here; the real response follows after the
        // TLS handshake
        return Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username: None,
                auth_response: vec![],
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ));
    }

    let (i, username) = {
        let (i, user) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;
        (i, Some(user.to_owned()))
    };
    let (i, auth_response) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let (i, size) = read_length_encoded_number(i)?;
            take(size).parse_peek(i)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, size) = le_u8.parse_peek(i)?;
            take(size).parse_peek(i)?
        } else {
            take_until(1.., "\0").parse_peek(i)?
        };

    let (i, db) = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty()
    {
        let (i, db) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;
        (i, Some(db))
    } else {
        (i, None)
    };

    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, auth_plugin) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal("\0").parse_peek(i)?;
            (i, auth_plugin)
        } else {
            (i, &b""[..])
        };

    let (i, connect_attributes) =
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
            let (i, data_len) = read_length_encoded_number(i)?;
            let (i, data) = take(data_len).parse_peek(i)?;
            let mut input = data;
            let mut connect_attributes = HashMap::new();
            while !input.is_empty() {
                let (remaining, k) = read_length_encoded_string(input)?;
                let (remaining, v) = read_length_encoded_string(remaining)?;
                let conn_attr_key = String::from_utf8_lossy(k).to_string();
                let conn_attr_val = String::from_utf8_lossy(v).to_string();
                connect_attributes.insert(conn_attr_key, conn_attr_val);
                input = remaining;
            }
            (i, Some(connect_attributes))
        } else {
            (i, None)
        };

    Ok((
        i,
        HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: u16::from(collation[0]),
            username,
            auth_response: auth_response.to_vec(),
            auth_plugin: auth_plugin.to_vec(),
            database: db.map(|c| c.to_vec()),
            connect_attributes,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use mysql_common::constants::CapabilityFlags;
    use std::io::Cursor;

    #[tokio::test]
    pub async fn test_handshake_parse() {
        let bytes = &[
            0x5b, 0x00, 0x00, 0x01, 0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c,
            0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d,
            0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75,
            0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76,
            0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let cursor = Cursor::new(&bytes[..]);
        let mut packet_reader = PacketReader::new(cursor);
        let (_, packet) = packet_reader.next_async().await.unwrap().unwrap();

        let handshake_rs = client_handshake_response(&packet, false);
        assert!(handshake_rs.is_ok());
        let handshake = handshake_rs.unwrap().1;
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.auth_plugin, b"mysql_native_password");
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[tokio::test]
    pub async fn test_handshake_parse_with_ssl() {
        let binary = &[
            0x25, 0x00, 0x00, 0x01, 0x85, 0xae, 0x3f, 0x20, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6a, 0x6f, 0x6e, 0x00, 0x00, 0x05,
        ];
        let cursor = Cursor::new(&binary[..]);
        let mut packet_reader = PacketReader::new(cursor);
        let (_, packet) = packet_reader.next_async().await.unwrap().unwrap();
        let (_, handshake) = client_handshake_response(&packet, true).unwrap();
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(!handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake.client_flag.contains(CapabilityFlags::CLIENT_SSL));
        assert_eq!(handshake.username.unwrap(), &b"jon"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    fn lenenc_number_forms() {
        assert_eq!(read_length_encoded_number(&[0x2a]).unwrap().1, 42);
        assert_eq!(
            read_length_encoded_number(&[0xfc, 0x10, 0x27]).unwrap().1,
            10000
        );
        assert_eq!(
            read_length_encoded_number(&[0xfd, 0x01, 0x00, 0x01]).unwrap().1,
            65537
        );
        assert_eq!(
            read_length_encoded_number(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0])
                .unwrap()
                .1,
            1
        );
    }

    #[test]
    fn lenenc_number_write_read_agree() {
        for value in [0u64, 0xfa, 0xfb, 0xffff, 0x10000, 0xff_ffff, 0x100_0000, u64::MAX] {
            let mut out = Vec::new();
            write_length_encoded_number(value, &mut out);
            let (rest, back) = read_length_encoded_number(&out).unwrap();
            assert!(rest.is_empty());
            assert_eq!(back, value, "value {value:#x}");
        }
    }

    #[test]
    fn greeting_decode() {
        // protocol 10, version "8.0.36", conn id 8, minimal tail
        let mut bytes = vec![0x0a];
        bytes.extend_from_slice(b"8.0.36\0");
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[0x61; 8]); // auth-plugin-data-part-1
        bytes.push(0x00); // filler
        bytes.extend_from_slice(&0xffffu16.to_le_bytes()); // caps low
        bytes.push(0x21); // collation
        bytes.extend_from_slice(&0x0002u16.to_le_bytes()); // status
        bytes.extend_from_slice(&0x0000u16.to_le_bytes()); // caps high
        bytes.push(21); // auth data len
        bytes.extend_from_slice(&[0x00; 10]); // reserved
        bytes.extend_from_slice(&[0x62; 13]); // auth-plugin-data-part-2

        let (_, greeting) = server_greeting(&bytes).unwrap();
        assert_eq!(greeting.protocol_version, 0x0a);
        assert_eq!(greeting.server_version, b"8.0.36");
        assert_eq!(greeting.connection_id, 8);
        assert!(greeting
            .capabilities
            .contains(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(looks_like_greeting(&bytes));
        assert!(!looks_like_greeting(b"GET /"));
    }
}
