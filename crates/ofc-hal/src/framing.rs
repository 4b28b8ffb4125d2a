//! Reading framed messages off the control channel

use ofc_core::{Error, Result};
use ofc_wire::{OfpHeader, WireError, OFP_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one complete message: the header, then exactly `length - 8` bytes.
///
/// Returns `Ok(None)` when the peer closed the stream on a message boundary.
/// A header that cannot be framed is an error; the stream is unusable after it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; OFP_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let parsed = OfpHeader::parse(&header).map_err(|e| match e {
        WireError::BadLength(len) => Error::protocol(format!("unframeable header length {}", len)),
        other => Error::from(other),
    })?;

    let mut frame = Vec::with_capacity(parsed.length as usize);
    frame.extend_from_slice(&header);
    frame.resize(parsed.length as usize, 0);
    reader.read_exact(&mut frame[OFP_HEADER_LEN..]).await?;
    Ok(Some(frame))
}

/// Write one already-encoded frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_back_to_back_frames() {
        let mut bytes = vec![0x01, 18, 0, 8, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0x01, 2, 0, 12, 0, 0, 0, 2, 9, 9, 9, 9]);
        let mut reader = &bytes[..];

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.len(), 8);
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(&second[8..], &[9, 9, 9, 9]);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_length_is_fatal() {
        let bytes = [0x01, 0, 0, 4, 0, 0, 0, 1];
        let mut reader = &bytes[..];
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let bytes = [0x01, 2, 0, 12, 0, 0, 0, 1, 0];
        let mut reader = &bytes[..];
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Io(_))));
    }
}
