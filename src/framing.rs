//! Length-prefixed frame codec used on every tunnel sub-stream.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Higher layers never observe a partial frame: a read either
//! yields the whole payload or fails.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

/// Largest payload a peer may send us in a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended in the middle of a header or payload.
    #[error("stream ended mid-frame")]
    ShortRead(#[source] std::io::Error),

    /// The announced payload length exceeds the configured cap.
    #[error("frame length {len} exceeds cap {cap}")]
    Oversize { len: u32, cap: usize },

    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortRead(err)
        } else {
            FrameError::Io(err)
        }
    }
}

/// Writes `payload` as one frame: header and payload in a single write.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversize {
        len: u32::MAX,
        cap: MAX_FRAME_LEN,
    })?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one whole frame, or fails without consuming payload bytes when the
/// announced length exceeds [`MAX_FRAME_LEN`].
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, FrameError>
where
    S: AsyncRead + Unpin,
{
    read_frame_with_cap(stream, MAX_FRAME_LEN).await
}

pub async fn read_frame_with_cap<S>(stream: &mut S, cap: usize) -> Result<Vec<u8>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len as usize > cap {
        return Err(FrameError::Oversize { len, cap });
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn round_trips_payload_bytes() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"hello tunnel").await.unwrap();
        buf.set_position(0);
        let payload = read_frame(&mut buf).await.unwrap();
        assert_eq!(payload, b"hello tunnel");
    }

    #[tokio::test]
    async fn round_trips_empty_frame() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"").await.unwrap();
        buf.set_position(0);
        assert_eq!(read_frame(&mut buf).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn back_to_back_frames_keep_boundaries() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"first").await.unwrap();
        write_frame(&mut buf, b"second").await.unwrap();
        buf.set_position(0);
        assert_eq!(read_frame(&mut buf).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut buf).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn rejects_oversize_without_consuming_payload() {
        let mut bytes = 0x0000_1000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB; 16]);
        let mut buf = Cursor::new(bytes);
        let err = read_frame_with_cap(&mut buf, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversize { len: 0x1000, cap: 64 }));
        // Only the header was consumed.
        assert_eq!(buf.position(), 4);
    }

    #[tokio::test]
    async fn eof_mid_payload_is_short_read() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"only4");
        let mut buf = Cursor::new(bytes);
        let err = read_frame(&mut buf).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead(_)));
    }

    #[tokio::test]
    async fn eof_mid_header_is_short_read() {
        let mut buf = Cursor::new(vec![0u8, 0]);
        let err = read_frame(&mut buf).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead(_)));
    }
}
