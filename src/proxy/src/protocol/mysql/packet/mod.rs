pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

/// `Packet` is one logical MySQL wire packet, already stripped of its
/// 3-byte length + 1-byte sequence header and re-joined when the
/// payload was split at the 16M boundary.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }

    /// Packet header is 0xfe and the length says OK-after-result-set
    /// when CLIENT_DEPRECATE_EOF is on.
    /// See: [MariaDB](https://mariadb.com/kb/en/result-set-packets/)
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&self.0.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

/// Decode one logical packet from the front of `i`, re-joining the
/// continuation chain that `encode_packets` produces: every chunk of
/// exactly 16M-1 bytes announces a follow-up carrying the next
/// sequence id. Yields the sequence id of the *last* wire packet
/// consumed so replies can continue the numbering, plus the bytes
/// after the frame. A sequence gap inside a chain is a hard failure;
/// a short buffer is a plain error so the caller reads more.
pub fn packet(i: &[u8]) -> nom::IResult<&[u8], (u8, Packet)> {
    let mut rest = i;
    let mut payload: Vec<u8> = Vec::new();
    let mut expected_seq: Option<u8> = None;
    loop {
        let (after_header, header) = nom::bytes::complete::take(constants::PACKET_HEADER_LEN)(rest)?;
        let chunk_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let seq = header[3];
        if let Some(expected) = expected_seq {
            if seq != expected {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Verify,
                )));
            }
        }
        let (after_chunk, chunk) = nom::bytes::complete::take(chunk_len)(after_header)?;
        payload.extend_from_slice(chunk);
        rest = after_chunk;
        if chunk_len < constants::MAX_PAYLOAD_LEN {
            return Ok((rest, (seq, Packet(payload))));
        }
        expected_seq = Some(seq.wrapping_add(1));
    }
}

/// Frame a payload for the wire, splitting at the 16M boundary. Used
/// when replaying captured payloads back to the client.
pub fn encode_packets(payload: &[u8], start_seq: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + constants::PACKET_HEADER_LEN);
    let mut seq = start_seq;
    for chunk in payload.chunks(constants::MAX_PAYLOAD_LEN) {
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes()[..3]);
        out.push(seq);
        out.extend_from_slice(chunk);
        seq = seq.wrapping_add(1);
    }
    // an empty payload, or one that is an exact multiple of 16M, still
    // needs a terminating (possibly empty) packet on the wire
    if payload.is_empty() || payload.len() % constants::MAX_PAYLOAD_LEN == 0 {
        out.extend_from_slice(&[0x00, 0x00, 0x00]);
        out.push(seq);
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::packet::*;

    #[test]
    fn query_frame_roundtrip() {
        let mut payload = vec![0x03];
        payload.extend_from_slice(b"SELECT 1");
        let wire = encode_packets(&payload, 0);
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &payload[..]);
    }

    #[test]
    fn encode_header_layout() {
        let framed = encode_packets(&[0x10, 0x20, 0x30], 2);
        assert_eq!(&framed[..4], &[0x03, 0x00, 0x00, 0x02]);
        assert_eq!(&framed[4..], &[0x10, 0x20, 0x30]);
    }

    #[test]
    fn trailing_bytes_stay_unconsumed() {
        let mut wire = encode_packets(&[0x0e], 0);
        wire.extend_from_slice(&encode_packets(&[0x01], 0));
        let (rest, (_, first)) = packet(&wire).unwrap();
        assert_eq!(&*first, &[0x0e]);
        let (rest, (_, second)) = packet(rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(&*second, &[0x01]);
    }

    #[test]
    fn split_payload_rejoins_at_the_boundary() {
        let mut payload = vec![0xab; constants::MAX_PAYLOAD_LEN];
        payload.push(0xcd);
        let wire = encode_packets(&payload, 0);
        // a full wire packet plus the one-byte remainder
        assert_eq!(
            wire.len(),
            payload.len() + 2 * constants::PACKET_HEADER_LEN
        );
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), payload.len());
        assert_eq!(pkt[constants::MAX_PAYLOAD_LEN], 0xcd);
        assert_eq!(&pkt[..constants::MAX_PAYLOAD_LEN], &payload[..constants::MAX_PAYLOAD_LEN]);
    }

    #[test]
    fn exact_multiple_carries_a_terminating_empty_packet() {
        let payload = vec![0x00; constants::MAX_PAYLOAD_LEN];
        let wire = encode_packets(&payload, 0);
        assert_eq!(
            wire.len(),
            payload.len() + 2 * constants::PACKET_HEADER_LEN
        );
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), constants::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn continuation_sequence_gap_is_rejected() {
        let payload = vec![0x11; constants::MAX_PAYLOAD_LEN + 1];
        let mut wire = encode_packets(&payload, 0);
        // corrupt the second header's sequence id
        wire[constants::PACKET_HEADER_LEN + constants::MAX_PAYLOAD_LEN + 3] = 9;
        assert!(matches!(packet(&wire), Err(nom::Err::Failure(_))));
    }

    #[test]
    fn empty_payload_frame() {
        let wire = encode_packets(&[], 4);
        assert_eq!(wire, vec![0x00, 0x00, 0x00, 0x04]);
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 4);
        assert!(pkt.is_empty());
    }

    #[test]
    fn truncated_frame_asks_for_more() {
        let wire = encode_packets(&[0x03, b'S'], 0);
        assert!(packet(&wire[..3]).is_err());
        assert!(packet(&wire[..5]).is_err());
    }
}
