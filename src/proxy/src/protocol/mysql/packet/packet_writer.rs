use crate::protocol::mysql::constants;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::prelude::*;
use std::io::IoSlice;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one packet payload, then frames it with length + sequence
/// headers on `end_packet`, splitting at the 16M payload boundary.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            for chunk in raw_packet.chunks(constants::MAX_PAYLOAD_LEN) {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                // a buffered AsyncWrite may take less than the whole
                // vectored write; fall back to write_all for the rest
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?
                }
            }
            Ok(())
        } else {
            // packet with an empty payload
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq();
            self.increase_seq();
            self.inner_writer.write_all(&header).await
        }
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet;

    #[tokio::test]
    async fn framed_write_roundtrips() {
        let mut sink = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut sink);
            writer.set_seq(1);
            writer.write_all(&[0x03]).unwrap();
            writer.write_all(b"SELECT 1").unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();
        }
        let (rest, (seq, pkt)) = packet(&sink).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(&pkt[1..], b"SELECT 1");
    }

    #[tokio::test]
    async fn empty_packet_write() {
        let mut sink = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut sink);
            writer.set_seq(3);
            writer.end_packet().await.unwrap();
        }
        assert_eq!(sink, vec![0x00, 0x00, 0x00, 0x03]);
    }
}
