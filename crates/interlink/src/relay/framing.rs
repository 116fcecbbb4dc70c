//! Length-prefixed framing over a byte stream.
//!
//! Each frame body is preceded by its length as a 4-byte big-endian integer.
//! The length is checked against the frame limit before anything is
//! allocated.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one frame body. Returns `Ok(None)` on a clean EOF at a frame
/// boundary; EOF anywhere inside a frame, length prefix included, is an error.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("stream ended after {filled} of 4 length bytes"),
                ))
            }
            n => filled += n,
        }
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} outside 1..={max_frame_bytes}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Writes one frame body with its length prefix and flushes.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_stream_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"first frame").await.unwrap();
            write_frame(&mut client, b"second").await.unwrap();
        });

        assert_eq!(read_frame(&mut server, 1024).await.unwrap().unwrap(), b"first frame");
        assert_eq!(read_frame(&mut server, 1024).await.unwrap().unwrap(), b"second");
        writer.await.unwrap();
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_length_prefix_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
