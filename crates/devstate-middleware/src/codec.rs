//! Async frame reader/writer for the socket wire format.
//!
//! A frame starts with the 12-byte header described in
//! [`devstate_types::message`]. The reader only checks the header bounds and
//! hands back the raw frame; [`Message::decode`] does the rest.

use devstate_types::{HEADER_SIZE, MAX_LINE_SIZE, Message};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame declares line_size={line_size} size={size}, below the header")]
    Undersized { line_size: u32, size: u32 },

    #[error("frame declares line_size={line_size} size={size}, above the limit")]
    Oversized { line_size: u32, size: u32 },

    #[error("connection closed with an incomplete frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// `true` for violations that leave the stream out of sync.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Undersized { .. } | Self::Oversized { .. })
    }
}

/// Validate a header and return `(line_size, size)`.
pub fn check_header(header: &[u8; HEADER_SIZE as usize]) -> Result<(u32, u32), FrameError> {
    let line_size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if size < HEADER_SIZE || line_size < size {
        return Err(FrameError::Undersized { line_size, size });
    }
    if line_size > MAX_LINE_SIZE {
        return Err(FrameError::Oversized { line_size, size });
    }
    Ok((line_size, size))
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next complete frame. Returns `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            filled += n;
        }

        let (line_size, _) = check_header(&header)?;
        let mut frame = vec![0u8; line_size as usize];
        frame[..header.len()].copy_from_slice(&header);
        match self.inner.read_exact(&mut frame[header.len()..]).await {
            Ok(_) => Ok(Some(frame)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write an already encoded frame.
    pub async fn write_raw(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<(), FrameError> {
        self.write_raw(&msg.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(line_size: u32, size: u32, type_id: u32) -> [u8; 12] {
        let mut h = [0u8; 12];
        h[0..4].copy_from_slice(&line_size.to_le_bytes());
        h[4..8].copy_from_slice(&size.to_le_bytes());
        h[8..12].copy_from_slice(&type_id.to_le_bytes());
        h
    }

    #[test]
    fn header_bounds() {
        assert!(check_header(&header(12, 12, 1)).is_ok());
        assert!(check_header(&header(MAX_LINE_SIZE, 16, 1)).is_ok());
        assert!(matches!(
            check_header(&header(8, 8, 1)),
            Err(FrameError::Undersized { .. })
        ));
        assert!(matches!(
            check_header(&header(12, 16, 1)),
            Err(FrameError::Undersized { .. })
        ));
        let err = check_header(&header(MAX_LINE_SIZE + 1, 12, 1)).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn reads_back_what_was_written() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let telinit = Message::Telinit {
            target: "USER".to_string(),
        };
        writer.write_message(&Message::StateQuery).await.unwrap();
        writer.write_message(&telinit).await.unwrap();
        drop(writer);

        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(Message::decode(&first).unwrap().0, Message::StateQuery);
        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(Message::decode(&second).unwrap().0, telinit);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_frame_at_eof_is_truncated() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_raw(&header(20, 16, 0x311)).await.unwrap();
        drop(writer);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading_body() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_raw(&header(1 << 20, 12, 1)).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { .. }));
    }
}
