//! Frame transport over a byte stream half.

use crate::error::ReplError;
use crate::proto::header::{HeaderVersion, PacketInfo, decode_header, encode_header};
use crate::proto::{Command, MAX_FRAME_PAYLOAD};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Reads length-prefixed frames; the header shape follows the negotiated
/// protocol version.
pub struct FrameReader<R> {
    inner: R,
    version: HeaderVersion,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            version: HeaderVersion::V80,
        }
    }

    pub fn set_version(&mut self, version: HeaderVersion) {
        self.version = version;
    }

    pub async fn recv(&mut self) -> Result<(PacketInfo, Vec<u8>), ReplError> {
        let mut header = vec![0u8; self.version.size()];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(ReplError::from_io)?;
        let info = decode_header(&header)?;
        if info.size as usize > MAX_FRAME_PAYLOAD {
            return Err(ReplError::malformed(format!(
                "payload length {}",
                info.size
            )));
        }
        let mut payload = vec![0u8; info.size as usize];
        if info.size > 0 {
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(ReplError::from_io)?;
        }
        trace!(cmd = %info.command, size = info.size, volume = info.volume, "frame in");
        Ok((info, payload))
    }
}

/// Writes frames in the negotiated header shape.
pub struct FrameWriter<W> {
    inner: W,
    version: HeaderVersion,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            version: HeaderVersion::V80,
        }
    }

    pub fn set_version(&mut self, version: HeaderVersion) {
        self.version = version;
    }

    pub async fn send(
        &mut self,
        command: Command,
        volume: i16,
        payload: &[u8],
    ) -> Result<(), ReplError> {
        let header = encode_header(self.version, command, payload.len() as u32, volume);
        self.inner
            .write_all(&header)
            .await
            .map_err(ReplError::from_io)?;
        if !payload.is_empty() {
            self.inner
                .write_all(payload)
                .await
                .map_err(ReplError::from_io)?;
        }
        self.inner.flush().await.map_err(ReplError::from_io)?;
        trace!(cmd = %command, size = payload.len(), "frame out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);

        w.send(Command::Ping, -1, &[]).await.unwrap();
        w.send(Command::Data, 0, b"hello").await.unwrap();

        let (info, payload) = r.recv().await.unwrap();
        assert_eq!(info.command, Command::Ping);
        assert!(payload.is_empty());

        let (info, payload) = r.recv().await.unwrap();
        assert_eq!(info.command, Command::Data);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn version_upgrade_carries_volume() {
        let (a, b) = tokio::io::duplex(4096);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);
        w.set_version(HeaderVersion::V100);
        r.set_version(HeaderVersion::V100);

        w.send(Command::WriteAck, 3, &[1, 2, 3]).await.unwrap();
        let (info, _) = r.recv().await.unwrap();
        assert_eq!(info.volume, 3);
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut r = FrameReader::new(b);
        r.set_version(HeaderVersion::V95);
        let mut raw = Vec::new();
        raw.extend_from_slice(&crate::proto::header::MAGIC_95.to_be_bytes());
        raw.extend_from_slice(&Command::Data.as_u16().to_be_bytes());
        raw.extend_from_slice(&(u32::MAX).to_be_bytes());
        a.write_all(&raw).await.unwrap();
        // header parses but the length is over the cap
        assert!(r.recv().await.is_err());
    }
}
