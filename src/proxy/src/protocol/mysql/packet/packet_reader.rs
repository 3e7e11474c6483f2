use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

/// Reads a byte stream and frames it into logical MySQL [`Packet`]s.
/// Unconsumed bytes stay buffered; `leftover` hands them back so the
/// stream can be returned to the flow without losing data.
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            r,
        }
    }

    /// Buffered bytes that were read but not parsed into a packet.
    pub fn leftover(self) -> (Vec<u8>, R) {
        (self.bytes, self.r)
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if !self.bytes.is_empty() {
                let parsed = match packet(&self.bytes) {
                    Ok((rest, p)) => Some((self.bytes.len() - rest.len(), p)),
                    Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_)) => None,
                    Err(nom::Err::Failure(ctx)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{:?}", ctx),
                        ));
                    }
                };
                if let Some((consumed, (seq, pkt))) = parsed {
                    self.bytes.drain(..consumed);
                    return Ok(Some((seq, pkt)));
                }
            }

            // we need to read some more
            let mut chunk = vec![0u8; buffer_size];
            let read = self.r.read(&mut chunk).await?;
            // use a larger buffer size to reduce resize rounds on big
            // result sets
            buffer_size = PACKET_LARGE_BUFFER_SIZE;
            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.bytes.len()),
                ));
            }
            self.bytes.extend_from_slice(&chunk[..read]);
        }
    }
}
