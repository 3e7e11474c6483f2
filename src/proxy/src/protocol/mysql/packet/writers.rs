use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::StatusFlags;
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

/// Generic server error surfaced to the client when replay cannot make
/// progress. sqlstate HY000.
pub const ER_UNKNOWN_ERROR: u16 = 1105;

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    code: u16,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(code)?;
    w.write_u8(b'#')?;
    w.write_all(b"HY000")?;
    w.write_all(msg)?;
    w.end_packet().await
}

pub async fn write_eof_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_all(&[0xfe, 0x00, 0x00])?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.end_packet().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    rows: u64,
    last_insert_id: u64,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_u8(0x00)?; // OK packet type
    w.write_lenenc_int(rows)?;
    w.write_lenenc_int(last_insert_id)?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.write_all(&[0x00, 0x00])?; // no warnings
    w.end_packet().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet;

    #[tokio::test]
    async fn ok_packet_bytes() {
        let mut sink = Vec::new();
        {
            let mut w = PacketWriter::new(&mut sink);
            w.set_seq(1);
            write_ok_packet(&mut w, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
                .await
                .unwrap();
        }
        let (_, (seq, pkt)) = packet(&sink).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(&*pkt, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn err_packet_carries_sqlstate() {
        let mut sink = Vec::new();
        {
            let mut w = PacketWriter::new(&mut sink);
            write_err_packet(ER_UNKNOWN_ERROR, b"no mock", &mut w)
                .await
                .unwrap();
        }
        let (_, (_, pkt)) = packet(&sink).unwrap();
        assert_eq!(pkt[0], 0xff);
        assert_eq!(u16::from_le_bytes([pkt[1], pkt[2]]), 1105);
        assert_eq!(pkt[3], b'#');
        assert_eq!(&pkt[4..9], b"HY000");
        assert_eq!(&pkt[9..], b"no mock");
    }

    #[tokio::test]
    async fn eof_packet_is_five_bytes() {
        let mut sink = Vec::new();
        {
            let mut w = PacketWriter::new(&mut sink);
            write_eof_packet(&mut w, StatusFlags::empty()).await.unwrap();
        }
        let (_, (_, pkt)) = packet(&sink).unwrap();
        assert!(pkt.is_eof_packet());
    }
}
