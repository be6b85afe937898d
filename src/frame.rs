//! Length-prefixed framing
//!
//! A frame is a 4-byte big-endian unsigned length followed by the payload.
//! The length counts the whole frame, prefix included, so an empty payload
//! is encoded as `00 00 00 04`.

use crate::errors::{FrameError, FrameResult};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes
pub const PREFIX_SIZE: usize = 4;

/// Encode a payload into a single frame
///
/// # Examples
///
/// ```
/// use tcp_connpool::frame;
///
/// let buf = frame::encode(b"hello").unwrap();
/// assert_eq!(&buf[..4], &[0, 0, 0, 9]);
/// assert_eq!(&buf[4..], b"hello");
/// ```
pub fn encode(payload: &[u8]) -> FrameResult<Vec<u8>> {
    let total = total_len(payload.len())?;

    let mut buf = Vec::with_capacity(PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame from the front of an in-memory buffer
///
/// Returns the payload and the number of bytes consumed. A buffer that ends
/// before the frame does yields [`FrameError::ShortRead`].
///
/// # Examples
///
/// ```
/// use tcp_connpool::frame;
///
/// let mut buf = frame::encode(b"abc").unwrap();
/// buf.extend_from_slice(&frame::encode(b"").unwrap());
///
/// let (first, used) = frame::decode(&buf).unwrap();
/// assert_eq!(first, b"abc");
/// let (second, _) = frame::decode(&buf[used..]).unwrap();
/// assert!(second.is_empty());
/// ```
pub fn decode(buf: &[u8]) -> FrameResult<(&[u8], usize)> {
    let prefix: [u8; PREFIX_SIZE] = buf
        .get(..PREFIX_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(FrameError::ShortRead {
            expected: PREFIX_SIZE,
        })?;
    let payload_len = payload_len(u32::from_be_bytes(prefix), None)?;

    let end = PREFIX_SIZE + payload_len;
    let payload = buf.get(PREFIX_SIZE..end).ok_or(FrameError::ShortRead {
        expected: payload_len,
    })?;
    Ok((payload, end))
}

/// Read exactly one frame and return its payload
///
/// `max_frame_size` bounds the total frame length announced by the prefix;
/// an oversized prefix is rejected before anything is allocated for it.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: Option<usize>) -> FrameResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; PREFIX_SIZE];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| read_error(e, PREFIX_SIZE))?;

    let payload_len = payload_len(u32::from_be_bytes(prefix), max_frame_size)?;

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| read_error(e, payload_len))?;
    Ok(payload)
}

/// Write one frame carrying `payload`
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> FrameResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = total_len(payload.len())?;
    writer
        .write_all(&total.to_be_bytes())
        .await
        .map_err(FrameError::Io)?;
    writer.write_all(payload).await.map_err(FrameError::Io)?;
    writer.flush().await.map_err(FrameError::Io)
}

fn total_len(payload_len: usize) -> FrameResult<u32> {
    payload_len
        .checked_add(PREFIX_SIZE)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(FrameError::TooLarge {
            len: payload_len.saturating_add(PREFIX_SIZE),
            max: u32::MAX as usize,
        })
}

fn payload_len(total: u32, max_frame_size: Option<usize>) -> FrameResult<usize> {
    let total = total as usize;
    if total < PREFIX_SIZE {
        return Err(FrameError::Malformed(total as u32));
    }
    if let Some(max) = max_frame_size
        && total > max
    {
        return Err(FrameError::TooLarge { len: total, max });
    }
    Ok(total - PREFIX_SIZE)
}

fn read_error(err: io::Error, expected: usize) -> FrameError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead { expected }
    } else {
        FrameError::Io(err)
    }
}
