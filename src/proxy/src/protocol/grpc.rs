use byteorder::{BigEndian, ByteOrder};

/// Length-prefixed gRPC message wrapper:
/// `[compression_flag: u8][len: u32 big-endian][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcMessage {
    pub compressed: u8,
    pub payload: Vec<u8>,
}

impl GrpcMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.push(self.compressed);
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.payload.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.payload);
        out
    }

    /// `None` when the buffer does not yet hold a whole message.
    pub fn decode(i: &[u8]) -> Option<(GrpcMessage, usize)> {
        if i.len() < 5 {
            return None;
        }
        let len = BigEndian::read_u32(&i[1..5]) as usize;
        let total = 5 + len;
        if i.len() < total {
            return None;
        }
        Some((
            GrpcMessage {
                compressed: i[0],
                payload: i[5..total].to_vec(),
            },
            total,
        ))
    }
}

/// RFC 7541 Appendix A, the static header table.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

fn decode_int(i: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    let mask = (1u16 << prefix_bits) as u64 - 1;
    let first = *i.first()? as u64 & mask;
    if first < mask {
        return Some((first, 1));
    }
    let mut value = mask;
    let mut shift = 0u32;
    for (idx, b) in i[1..].iter().enumerate() {
        value += ((*b as u64) & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((value, idx + 2));
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    None
}

/// Decoded string, or `None` for huffman-coded content we only skip.
fn decode_string(i: &[u8]) -> Option<(Option<String>, usize)> {
    let huffman = *i.first()? & 0x80 != 0;
    let (len, used) = decode_int(i, 7)?;
    let total = used + len as usize;
    if i.len() < total {
        return None;
    }
    if huffman {
        return Some((None, total));
    }
    Some((
        Some(String::from_utf8_lossy(&i[used..total]).into_owned()),
        total,
    ))
}

/// Best-effort decode of an HPACK header block: static-table indexed
/// fields and non-huffman literals resolve; huffman-coded strings and
/// dynamic-table references are skipped with correct framing. Raw
/// frames are preserved elsewhere, so this only feeds metadata.
pub fn decode_header_block(block: &[u8]) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut i = block;
    while let Some(&b) = i.first() {
        if b & 0x80 != 0 {
            // indexed header field
            let Some((idx, used)) = decode_int(i, 7) else { break };
            i = &i[used..];
            if let Some((name, value)) = static_entry(idx) {
                fields.push((name.to_string(), value.to_string()));
            }
            continue;
        }
        if b & 0xe0 == 0x20 {
            // dynamic table size update
            let Some((_, used)) = decode_int(i, 5) else { break };
            i = &i[used..];
            continue;
        }
        let prefix_bits = if b & 0xc0 == 0x40 { 6 } else { 4 };
        let Some((idx, used)) = decode_int(i, prefix_bits) else { break };
        i = &i[used..];
        let name = if idx == 0 {
            let Some((name, used)) = decode_string(i) else { break };
            i = &i[used..];
            name
        } else {
            static_entry(idx).map(|(n, _)| n.to_string())
        };
        let Some((value, used)) = decode_string(i) else { break };
        i = &i[used..];
        if let (Some(name), Some(value)) = (name, value) {
            fields.push((name, value));
        }
    }
    fields
}

fn static_entry(idx: u64) -> Option<(&'static str, &'static str)> {
    if idx == 0 || idx as usize > STATIC_TABLE.len() {
        return None;
    }
    Some(STATIC_TABLE[idx as usize - 1])
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    // 7-bit prefixed length, no huffman bit
    let len = s.len();
    if len < 0x7f {
        out.push(len as u8);
    } else {
        out.push(0x7f);
        let mut rem = len - 0x7f;
        while rem >= 0x80 {
            out.push((rem as u8 & 0x7f) | 0x80);
            rem >>= 7;
        }
        out.push(rem as u8);
    }
    out.extend_from_slice(s.as_bytes());
}

fn encode_literal(name: &str, value: &str, out: &mut Vec<u8>) {
    // literal header field never indexed, new name
    out.push(0x10);
    encode_str(name, out);
    encode_str(value, out);
}

/// Response headers for a synthesized gRPC reply: `:status: 200` from
/// the static table plus a literal content-type.
pub fn encode_response_headers() -> Vec<u8> {
    let mut out = vec![0x88]; // indexed :status 200
    encode_literal("content-type", "application/grpc", &mut out);
    out
}

/// Trailers carrying the final status: `grpc-status` is the decimal
/// status string, `grpc-message` the human-readable text.
pub fn encode_trailers(status: &str, message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    encode_literal("grpc-status", status, &mut out);
    if !message.is_empty() {
        encode_literal("grpc-message", message, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wrapper_layout() {
        let wire = GrpcMessage {
            compressed: 0,
            payload: b"hi".to_vec(),
        }
        .encode();
        assert_eq!(wire, vec![0x00, 0x00, 0x00, 0x00, 0x02, b'h', b'i']);
        let (back, used) = GrpcMessage::decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(back.payload, b"hi");
    }

    #[test]
    fn message_decode_incomplete() {
        let wire = GrpcMessage {
            compressed: 0,
            payload: vec![1, 2, 3],
        }
        .encode();
        assert!(GrpcMessage::decode(&wire[..4]).is_none());
        assert!(GrpcMessage::decode(&wire[..7]).is_none());
    }

    #[test]
    fn trailer_roundtrip_through_decoder() {
        let block = encode_trailers("0", "ok then");
        let fields = decode_header_block(&block);
        assert_eq!(
            fields,
            vec![
                ("grpc-status".to_string(), "0".to_string()),
                ("grpc-message".to_string(), "ok then".to_string()),
            ]
        );
    }

    #[test]
    fn indexed_status_200_decodes() {
        let block = encode_response_headers();
        let fields = decode_header_block(&block);
        assert_eq!(fields[0], (":status".to_string(), "200".to_string()));
        assert_eq!(
            fields[1],
            ("content-type".to_string(), "application/grpc".to_string())
        );
    }

    #[test]
    fn huffman_strings_are_skipped_with_correct_framing() {
        // literal never indexed, new name: huffman name (3 bytes),
        // plain value, then a decodable literal follows
        let mut block = vec![0x10, 0x83, 0xaa, 0xbb, 0xcc, 0x01, b'x'];
        block.extend_from_slice(&encode_trailers("0", ""));
        let fields = decode_header_block(&block);
        assert_eq!(fields, vec![("grpc-status".to_string(), "0".to_string())]);
    }

    #[test]
    fn long_literal_values_use_continuation_lengths() {
        let long = "x".repeat(300);
        let block = encode_trailers("13", &long);
        let fields = decode_header_block(&block);
        assert_eq!(fields[0].1, "13");
        assert_eq!(fields[1].1, long);
    }

    #[test]
    fn integer_continuation_decoding() {
        // 1337 with 5-bit prefix per RFC 7541 C.1.2
        let bytes = [0x3f, 0x9a, 0x0a];
        let (value, used) = decode_int(&bytes, 5).unwrap();
        assert_eq!(value, 1337);
        assert_eq!(used, 3);
    }
}
