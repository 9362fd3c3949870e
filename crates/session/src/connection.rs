use chunkvault_protocol::{Message, MessageType, WireError, read_message, write_message};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::error::SessionError;

/// Read buffer for one stream; large enough for a full `chunk_data` line.
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// One side of a stream connection.
///
/// The sending side numbers its requests; [`request`](Self::request) checks
/// that the reply echoes the number, which keeps exactly one request in
/// flight.
pub struct Connection<R, W> {
    reader: BufReader<R>,
    writer: W,
    last_seq: u64,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            writer,
            last_seq: 0,
        }
    }

    /// Next message, or `None` on clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Message>, SessionError> {
        Ok(read_message(&mut self.reader).await?)
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        write_message(&mut self.writer, msg).await?;
        Ok(())
    }

    /// Sends a request and waits for its reply.
    ///
    /// An `error` reply becomes [`SessionError::Remote`].
    pub async fn request<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, SessionError> {
        self.last_seq += 1;
        let seq = self.last_seq;

        let msg = Message::new(seq, msg_type, payload)?;
        self.send(&msg).await?;

        let reply = self.recv().await?.ok_or(SessionError::ConnectionClosed)?;
        // Seq 0 is reserved for unsolicited errors (receiver shutting down).
        if reply.msg_type == MessageType::Error && (reply.seq == seq || reply.seq == 0) {
            let err = reply.error.unwrap_or(WireError {
                code: 0,
                message: "unspecified".into(),
            });
            return Err(SessionError::Remote(err));
        }
        if reply.seq != seq {
            return Err(SessionError::SeqMismatch {
                expected: seq,
                got: reply.seq,
            });
        }
        Ok(reply)
    }

    /// Sends a payload-less request.
    pub async fn request_bare(&mut self, msg_type: MessageType) -> Result<Message, SessionError> {
        self.request::<()>(msg_type, None).await
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_matches_reply_seq() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut client = Connection::new(ar, aw);
        let mut server = Connection::new(br, bw);

        let echo = tokio::spawn(async move {
            let msg = server.recv().await.unwrap().unwrap();
            server
                .send(&msg.reply_bare(MessageType::StreamOpenAck))
                .await
                .unwrap();
            let msg = server.recv().await.unwrap().unwrap();
            // Wrong seq on purpose.
            server
                .send(&Message::bare(msg.seq + 5, MessageType::SendFile))
                .await
                .unwrap();
        });

        let reply = client.request_bare(MessageType::StreamOpen).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::StreamOpenAck);
        assert_eq!(reply.seq, 1);

        let err = client
            .request_bare(MessageType::FileDescriptor)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::SeqMismatch {
                expected: 2,
                got: 7
            }
        ));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_becomes_remote() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut client = Connection::new(ar, aw);
        let mut server = Connection::new(br, bw);

        tokio::spawn(async move {
            let msg = server.recv().await.unwrap().unwrap();
            server.send(&msg.reply_error(400, "no")).await.unwrap();
        });

        let err = client.request_bare(MessageType::StreamOpen).await.unwrap_err();
        match err {
            SessionError::Remote(e) => assert_eq!(e.code, 400),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        drop(b);
        let mut client = Connection::new(ar, aw);
        assert!(client.request_bare(MessageType::StreamOpen).await.is_err());
    }
}
