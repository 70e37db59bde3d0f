use super::{Message, MAX_FRAME_LEN};
use crate::error::{P2pError, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    debug!("Sent {} ({} bytes)", message.kind(), bytes.len());
    Ok(())
}

/// Read one framed message, treating a closed connection as an I/O error
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    match try_read_message(reader).await? {
        Some(message) => Ok(message),
        None => Err(P2pError::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by remote",
        ))),
    }
}

/// Read one framed message. Returns `None` if the connection was closed
/// cleanly before a new frame started.
pub async fn try_read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    // Read length prefix (4 bytes)
    let mut length_buf = [0u8; 4];
    let mut filled = 0;
    while filled < length_buf.len() {
        let n = reader.read(&mut length_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(P2pError::ProtocolError(
                "Truncated frame length".to_string(),
            ));
        }
        filled += n;
    }

    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(P2pError::ProtocolError(format!(
            "Frame length {} exceeds limit of {} bytes",
            length, MAX_FRAME_LEN
        )));
    }

    // Read message payload
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            P2pError::ProtocolError(format!("Truncated frame: expected {} bytes", length))
        } else {
            P2pError::IoError(e)
        }
    })?;

    let message = Message::from_payload(&payload)?;
    debug!("Received {} ({} bytes)", message.kind(), length);

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_write_then_read() {
        let message = Message::ShareAnnounce {
            name: "notes.txt".to_string(),
        };

        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &message).await.unwrap();

        let mut reader = buf.as_slice();
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_split_length_prefix() {
        let frame = Message::LeaveAck.to_bytes().unwrap();
        let mut mock = Builder::new()
            .read(&frame[..2])
            .read(&frame[2..5])
            .read(&frame[5..])
            .build();

        let decoded = read_message(&mut mock).await.unwrap();
        assert_eq!(decoded, Message::LeaveAck);
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let mut mock = Builder::new().build();
        assert!(try_read_message(&mut mock).await.unwrap().is_none());

        let mut mock = Builder::new().build();
        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(P2pError::IoError(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut mock = Builder::new()
            .read(&[0, 0, 0, 40])
            .read(br#"{"type":"#)
            .build();

        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(P2pError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let mut mock = Builder::new().read(&[0, 0]).build();

        let result = try_read_message(&mut mock).await;
        assert!(matches!(result, Err(P2pError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_length_overflow() {
        let mut mock = Builder::new().read(&[0xff, 0xff, 0xff, 0xff]).build();

        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(P2pError::ProtocolError(_))));
    }
}
