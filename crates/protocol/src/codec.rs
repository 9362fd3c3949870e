//! Line codec for stream messages.
//!
//! # Wire format
//!
//! ```text
//! one message per line:   <JSON envelope>\n
//! envelope:               {"seq":N,"type":"...","payload":{...},"error":{...}}
//! ```
//!
//! A line may end in `\r\n`. Lines longer than [`MAX_LINE_LEN`] are rejected
//! before they are buffered in full.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_LINE_LEN;
use crate::envelope::Message;
use crate::error::ProtocolError;

/// Writes one message as a JSON line and flushes.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(msg)?;
    if line.len() >= MAX_LINE_LEN {
        return Err(ProtocolError::LineTooLong {
            len: line.len(),
            max: MAX_LINE_LEN,
        });
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next message.
///
/// Returns `None` on a clean end of stream (no bytes since the last line).
pub async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ProtocolError> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong {
                len: line.len(),
                max: MAX_LINE_LEN,
            });
        }
        return Err(ProtocolError::UnexpectedEof);
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(serde_json::from_slice(&line)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MessageType;
    use crate::messages::{ChunkDataRequest, StreamOpenRequest};
    use crate::types::{Digest, DigestAlgorithm};

    #[tokio::test]
    async fn message_roundtrip() {
        let open = StreamOpenRequest {
            job_id: "job-1".into(),
            stream_id: 2,
            source_host: "web01".into(),
            digest: DigestAlgorithm::Sha256,
        };
        let msg = Message::new(1, MessageType::StreamOpen, Some(&open)).unwrap();

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut cursor = &buf[..];
        let parsed = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.msg_type, MessageType::StreamOpen);
        let payload: StreamOpenRequest = parsed.require_payload().unwrap();
        assert_eq!(payload, open);
    }

    #[tokio::test]
    async fn multiple_messages_then_eof() {
        let mut buf = Vec::new();
        for seq in 1..=3 {
            write_message(&mut buf, &Message::bare(seq, MessageType::StreamClose))
                .await
                .unwrap();
        }

        let mut cursor = &buf[..];
        for seq in 1..=3 {
            let msg = read_message(&mut cursor).await.unwrap().unwrap();
            assert_eq!(msg.seq, seq);
        }
        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accepts_crlf() {
        let buf = b"{\"seq\":7,\"type\":\"send_file\"}\r\n".to_vec();
        let mut cursor = &buf[..];
        let msg = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.msg_type, MessageType::SendFile);
    }

    #[tokio::test]
    async fn truncated_line_is_unexpected_eof() {
        let buf = b"{\"seq\":7,\"type\":".to_vec();
        let mut cursor = &buf[..];
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn garbage_line_is_json_error() {
        let buf = b"START_STREAM:job:1\n".to_vec();
        let mut cursor = &buf[..];
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let buf = b"{\"seq\":1,\"type\":\"launch_game\"}\n".to_vec();
        let mut cursor = &buf[..];
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversized_line_rejected_on_read() {
        let mut buf = vec![b'a'; MAX_LINE_LEN + 10];
        buf.push(b'\n');
        let mut cursor = &buf[..];
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { .. }));
    }

    #[tokio::test]
    async fn oversized_message_rejected_on_write() {
        let req = ChunkDataRequest {
            digest: Digest::from_bytes([0; 32]),
            data: vec![0u8; MAX_LINE_LEN],
        };
        let msg = Message::new(1, MessageType::ChunkData, Some(&req)).unwrap();
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &msg).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { .. }));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn max_chunk_fits_through_codec() {
        let req = ChunkDataRequest {
            digest: Digest::from_bytes([0; 32]),
            data: vec![0xA5; crate::constants::MAX_CHUNK_SIZE],
        };
        let msg = Message::new(9, MessageType::ChunkData, Some(&req)).unwrap();

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = &buf[..];
        let parsed = read_message(&mut cursor).await.unwrap().unwrap();
        let back: ChunkDataRequest = parsed.require_payload().unwrap();
        assert_eq!(back.data.len(), crate::constants::MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn works_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_cr, mut cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(sr);

        write_message(&mut cw, &Message::bare(5, MessageType::StreamClose))
            .await
            .unwrap();
        let msg = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(msg.seq, 5);
    }
}
