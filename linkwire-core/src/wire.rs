//! Length-prefixed frame codec.
//!
//! Every frame is a fixed-width ASCII decimal header (left-justified,
//! space-padded) followed by exactly that many payload bytes. The codec
//! never interprets payload content.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// Default header width in bytes, matching the reference implementation.
pub const DEFAULT_HEADER_LEN: usize = 16;

/// Render `payload_len` as an ASCII decimal header of exactly `header_len`
/// bytes, left-justified and space-padded.
///
/// # Panics
///
/// Panics if `payload_len` does not fit in `header_len` decimal digits.
pub fn make_header(payload_len: usize, header_len: usize) -> Vec<u8> {
    let digits = payload_len.to_string();
    assert!(
        digits.len() <= header_len,
        "payload length {} does not fit in a {}-byte header",
        payload_len,
        header_len
    );
    let mut header = digits.into_bytes();
    header.resize(header_len, b' ');
    header
}

/// Parse a fixed-width ASCII decimal header, tolerating trailing spaces.
pub fn parse_header(bytes: &[u8]) -> Result<usize, CoreError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CoreError::MalformedHeader {
            bytes: bytes.to_vec(),
        })?
        .trim_end();
    text.parse::<usize>().map_err(|_| CoreError::MalformedHeader {
        bytes: bytes.to_vec(),
    })
}

/// A decoded frame: the raw header bytes and the payload they describe.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Read exactly one frame from `reader`.
///
/// A zero-byte read where the header was expected is reported as
/// [`CoreError::Disconnected`]; any other I/O failure or a header that does
/// not parse as a decimal integer is reported distinctly so callers can tell
/// a clean hang-up from a protocol violation.
pub async fn receive_frame<R>(reader: &mut R, header_len: usize) -> Result<Frame, CoreError>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; header_len];
    let n = read_full_or_eof(reader, &mut header).await?;
    if n == 0 {
        return Err(CoreError::Disconnected);
    }
    if n != header_len {
        return Err(CoreError::MalformedHeader {
            bytes: header[..n].to_vec(),
        });
    }

    let payload_len = parse_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Frame { header, payload })
}

/// Write one frame (header + payload) to `writer` and flush it.
pub async fn send_frame<W>(writer: &mut W, payload: &[u8], header_len: usize) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let header = make_header(payload.len(), header_len);
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read into `buf` until full or until EOF is hit on the very first byte.
/// Returns the number of bytes actually read, so the caller can distinguish
/// a clean peer disconnect (0 bytes) from a truncated header (1..buf.len()).
async fn read_full_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, CoreError>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        for n in [0usize, 1, 15, 255, 65535, 999_999_999_999_999] {
            let header = make_header(n, 16);
            assert_eq!(header.len(), 16);
            assert_eq!(parse_header(&header).unwrap(), n);
        }
    }

    #[test]
    fn header_is_left_justified_space_padded() {
        let header = make_header(42, 16);
        assert_eq!(&header[..2], b"42");
        assert!(header[2..].iter().all(|&b| b == b' '));
    }

    #[test]
    #[should_panic]
    fn header_overflow_panics() {
        make_header(10_000_000_000_000_000, 16);
    }

    #[test]
    fn parse_header_rejects_garbage() {
        let bytes = b"not a number    ";
        assert!(matches!(
            parse_header(bytes),
            Err(CoreError::MalformedHeader { .. })
        ));
    }

    #[tokio::test]
    async fn send_then_receive_frame() {
        let (mut client, mut server) = tokio::io::duplex(256);
        send_frame(&mut client, b"hello", 16).await.unwrap();
        let frame = receive_frame(&mut server, 16).await.unwrap();
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn send_then_receive_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(256);
        send_frame(&mut client, b"", 16).await.unwrap();
        let frame = receive_frame(&mut server, 16).await.unwrap();
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn clean_disconnect_is_reported_distinctly() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        let err = receive_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, CoreError::Disconnected));
    }
}
