//! Coordinator-side client for the sandboxer sidecar.
//!
//! Connects to the sidecar over its Unix domain socket and performs the
//! ready/ping/pong handshake, then issues materialize/discard requests
//! matched to responses by sequence number.
//!
//! ## Connection Flow
//!
//! 1. Sidecar listens on the configured socket path
//! 2. Coordinator connects; sidecar sends `ready`
//! 3. Coordinator sends `ping`, waits for `pong`
//! 4. Connection established — coordinator can issue requests

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};
use tracing::debug;
use uuid::Uuid;

use sandboxer_proto::{
    Decoder, FINGERPRINT_SIZE, FileFrame, MSG_DISCARD, MSG_DISCARD_RESULT, MSG_ERROR,
    MSG_MATERIALIZE, MSG_MATERIALIZE_RESULT, MSG_PING, MSG_PONG, MSG_READY, MSG_SHUTDOWN,
    MSG_SHUTDOWN_ACK, RawMessage,
};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Per-request timeout for materialize. Large inputs take a while to write.
const MATERIALIZE_TIMEOUT: Duration = Duration::from_secs(300);
const DISCARD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The sidecar socket could not be reached. Callers that require the
    /// sidecar must treat this as fatal, never fall back to in-process writes.
    #[error("sandboxer unavailable at {socket}: {source}")]
    Unavailable {
        socket: String,
        #[source]
        source: io::Error,
    },

    /// The sidecar rejected the request (conflict, invalid state, write failure).
    #[error("sandboxer rejected request: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] sandboxer_proto::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Persistent connection to the sandboxer sidecar.
#[derive(Debug)]
pub struct SandboxerClient {
    stream: UnixStream,
    decoder: Decoder,
    next_seq: u32,
    /// Reusable read buffer (avoids inflating async Future size).
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl SandboxerClient {
    /// Connect to the sidecar socket and perform the handshake.
    pub async fn connect(socket_path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let stream = time::timeout_at(deadline, UnixStream::connect(socket_path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))
            .and_then(|r| r)
            .map_err(|source| ClientError::Unavailable {
                socket: socket_path.display().to_string(),
                source,
            })?;

        let mut client = Self {
            stream,
            decoder: Decoder::new(),
            next_seq: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        };
        client.handshake(deadline).await?;
        debug!(socket = %socket_path.display(), "connected to sandboxer");
        Ok(client)
    }

    /// Perform the connection handshake: ready → ping → pong.
    async fn handshake(&mut self, deadline: Instant) -> Result<()> {
        self.read_until(deadline, |m| m.msg_type == MSG_READY)
            .await?;

        let seq = self.next_seq();
        let ping = sandboxer_proto::encode(MSG_PING, seq, &[])?;
        self.stream.write_all(&ping).await?;

        self.read_until(deadline, |m| m.msg_type == MSG_PONG && m.seq == seq)
            .await?;
        Ok(())
    }

    /// Read one batch of messages from the stream, respecting the deadline.
    async fn read_batch(&mut self, deadline: Instant) -> Result<Vec<RawMessage>> {
        let n = time::timeout_at(deadline, self.stream.read(self.read_buf.as_mut()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;

        if n == 0 {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "sandboxer connection closed",
            )));
        }

        // n <= read_buf.len() is guaranteed by read()
        let messages = self
            .decoder
            .decode(self.read_buf.get(..n).unwrap_or_default())?;
        Ok(messages)
    }

    /// Read messages until one matches the predicate or the deadline passes.
    async fn read_until(
        &mut self,
        deadline: Instant,
        predicate: impl Fn(&RawMessage) -> bool,
    ) -> Result<RawMessage> {
        loop {
            let messages = self.read_batch(deadline).await?;
            for msg in messages {
                if predicate(&msg) {
                    return Ok(msg);
                }
            }
        }
    }

    /// Get next sequence number, wrapping around and skipping 0.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        seq
    }

    /// Send a request and wait for a response with matching sequence number.
    async fn request(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<RawMessage> {
        let seq = self.next_seq();
        let data = sandboxer_proto::encode(msg_type, seq, payload)?;
        self.stream.write_all(&data).await?;

        let deadline = Instant::now() + timeout;
        self.read_until(deadline, |m| m.seq == seq).await
    }

    /// Ask the sidecar to materialize `files` into sandbox `id`.
    ///
    /// Returns the content fingerprint the sidecar computed. Re-sending the
    /// same file set is a no-op on the sidecar and yields the same
    /// fingerprint; a differing file set is rejected.
    pub async fn materialize(
        &mut self,
        id: Uuid,
        files: &[FileFrame<'_>],
    ) -> Result<[u8; FINGERPRINT_SIZE]> {
        let payload = sandboxer_proto::encode_materialize(id.as_bytes(), files)?;
        let resp = self
            .request(MSG_MATERIALIZE, &payload, MATERIALIZE_TIMEOUT)
            .await?;

        if resp.msg_type == MSG_ERROR {
            let msg = sandboxer_proto::decode_error(&resp.payload)?;
            return Err(ClientError::Rejected(msg.to_string()));
        }
        if resp.msg_type != MSG_MATERIALIZE_RESULT {
            return Err(unexpected_response(resp.msg_type));
        }

        let (success, fingerprint, error) =
            sandboxer_proto::decode_materialize_result(&resp.payload)?;
        if !success {
            return Err(ClientError::Rejected(error.to_string()));
        }
        Ok(fingerprint)
    }

    /// Ask the sidecar to discard sandbox `id` and delete its directory.
    pub async fn discard(&mut self, id: Uuid) -> Result<()> {
        let payload = sandboxer_proto::encode_discard(id.as_bytes());
        let resp = self.request(MSG_DISCARD, &payload, DISCARD_TIMEOUT).await?;

        if resp.msg_type == MSG_ERROR {
            let msg = sandboxer_proto::decode_error(&resp.payload)?;
            return Err(ClientError::Rejected(msg.to_string()));
        }
        if resp.msg_type != MSG_DISCARD_RESULT {
            return Err(unexpected_response(resp.msg_type));
        }

        let (success, error) = sandboxer_proto::decode_discard_result(&resp.payload)?;
        if !success {
            return Err(ClientError::Rejected(error.to_string()));
        }
        Ok(())
    }

    /// Request graceful sidecar shutdown.
    ///
    /// Returns `true` if the sidecar acknowledged, `false` on timeout.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        let result = self.request(MSG_SHUTDOWN, &[], timeout).await;
        matches!(result, Ok(ref m) if m.msg_type == MSG_SHUTDOWN_ACK)
    }
}

fn unexpected_response(msg_type: u8) -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response type: 0x{msg_type:02X}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    /// Perform mock sidecar handshake: send ready, receive ping, send pong.
    async fn mock_handshake(stream: &mut UnixStream, decoder: &mut Decoder) {
        let ready = sandboxer_proto::encode(MSG_READY, 0, &[]).unwrap();
        stream.write_all(&ready).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let msgs = decoder.decode(&buf[..n]).unwrap();
        assert_eq!(msgs[0].msg_type, MSG_PING);

        let pong = sandboxer_proto::encode(MSG_PONG, msgs[0].seq, &[]).unwrap();
        stream.write_all(&pong).await.unwrap();
    }

    async fn client_from_stream(stream: UnixStream) -> Result<SandboxerClient> {
        let mut client = SandboxerClient {
            stream,
            decoder: Decoder::new(),
            next_seq: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        client.handshake(deadline).await?;
        Ok(client)
    }

    #[tokio::test]
    async fn test_materialize() {
        let (client_stream, mut sidecar) = make_pair();
        let id = Uuid::new_v4();
        let expected_id = *id.as_bytes();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 8192];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();
            assert_eq!(msgs[0].msg_type, MSG_MATERIALIZE);

            let (sandbox_id, files) =
                sandboxer_proto::decode_materialize(&msgs[0].payload).unwrap();
            assert_eq!(sandbox_id, expected_id);
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].path, "run.sh");
            assert!(files[0].executable);

            let payload = sandboxer_proto::encode_materialize_result(true, &[7u8; 32], "");
            let resp =
                sandboxer_proto::encode(MSG_MATERIALIZE_RESULT, msgs[0].seq, &payload).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        let fp = client
            .materialize(
                id,
                &[FileFrame {
                    path: "run.sh",
                    contents: b"#!/bin/sh\n",
                    executable: true,
                }],
            )
            .await
            .unwrap();
        assert_eq!(fp, [7u8; 32]);
    }

    #[tokio::test]
    async fn test_materialize_rejected() {
        let (client_stream, mut sidecar) = make_pair();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 8192];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();

            let payload = sandboxer_proto::encode_materialize_result(
                false,
                &[0u8; 32],
                "sandbox already materialized with different inputs",
            );
            let resp =
                sandboxer_proto::encode(MSG_MATERIALIZE_RESULT, msgs[0].seq, &payload).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        let err = client
            .materialize(Uuid::new_v4(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m.contains("different inputs")));
    }

    #[tokio::test]
    async fn test_discard() {
        let (client_stream, mut sidecar) = make_pair();
        let id = Uuid::new_v4();
        let expected_id = *id.as_bytes();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 1024];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();
            assert_eq!(msgs[0].msg_type, MSG_DISCARD);
            assert_eq!(
                sandboxer_proto::decode_discard(&msgs[0].payload).unwrap(),
                expected_id
            );

            let payload = sandboxer_proto::encode_discard_result(true, "");
            let resp = sandboxer_proto::encode(MSG_DISCARD_RESULT, msgs[0].seq, &payload).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        client.discard(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_rejected() {
        let (client_stream, mut sidecar) = make_pair();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 1024];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();

            let payload = sandboxer_proto::encode_discard_result(false, "permission denied");
            let resp = sandboxer_proto::encode(MSG_DISCARD_RESULT, msgs[0].seq, &payload).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        let err = client.discard(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m.contains("permission denied")));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (client_stream, mut sidecar) = make_pair();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 1024];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();
            assert_eq!(msgs[0].msg_type, MSG_SHUTDOWN);

            let resp = sandboxer_proto::encode(MSG_SHUTDOWN_ACK, msgs[0].seq, &[]).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        assert!(client.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_connect_unavailable() {
        let dir = std::env::temp_dir().join(format!("no-sidecar-{}", Uuid::new_v4()));
        let err = SandboxerClient::connect(&dir, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_error_response_is_rejected() {
        let (client_stream, mut sidecar) = make_pair();

        tokio::spawn(async move {
            let mut decoder = Decoder::new();
            mock_handshake(&mut sidecar, &mut decoder).await;

            let mut buf = [0u8; 8192];
            let n = sidecar.read(&mut buf).await.unwrap();
            let msgs = decoder.decode(&buf[..n]).unwrap();

            let payload = sandboxer_proto::encode_error("malformed payload");
            let resp = sandboxer_proto::encode(MSG_ERROR, msgs[0].seq, &payload).unwrap();
            sidecar.write_all(&resp).await.unwrap();
        });

        let mut client = client_from_stream(client_stream).await.unwrap();
        let err = client
            .materialize(Uuid::new_v4(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m.contains("malformed")));
    }
}
