//! Sidecar server loop.
//!
//! The sandboxer listens on a Unix domain socket and is the only process
//! that ever opens sandbox input files for writing. The execution
//! coordinator connects, handshakes (ready → ping → pong), and issues
//! materialize/discard requests. Keeping the writer in a separate process
//! means the coordinator can never hold a stale write descriptor on a
//! binary it is about to execute, which is the text-busy fix.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use sandboxer_proto::{
    Decoder, FINGERPRINT_SIZE, MSG_DISCARD, MSG_ERROR, MSG_MATERIALIZE, MSG_PING, MSG_READY,
    MSG_SHUTDOWN, ProtocolError, RawMessage, encode, encode_discard_result, encode_error,
    encode_materialize_result,
};
use sandboxer_proto::{MSG_DISCARD_RESULT, MSG_MATERIALIZE_RESULT, MSG_PONG, MSG_SHUTDOWN_ACK};

use crate::store::{InputFile, SandboxStore};

const READ_BUF_SIZE: usize = 64 * 1024;

fn to_io_error(e: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Long-lived sidecar server bound to a Unix domain socket.
pub struct SandboxerServer {
    listener: UnixListener,
    store: Arc<SandboxStore>,
    shutdown: Arc<Notify>,
}

impl SandboxerServer {
    /// Bind the listener, replacing any stale socket file.
    pub fn bind(socket_path: &Path, store: Arc<SandboxStore>) -> io::Result<Self> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "sandboxer listening");
        Ok(Self {
            listener,
            store,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Handle for requesting a graceful stop (signal handler, tests).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Accept connections until a shutdown request arrives.
    ///
    /// Each connection is served on its own task, so materialization for
    /// distinct sandboxes proceeds independently across connections.
    pub async fn run(self) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let store = Arc::clone(&self.store);
                    let shutdown = Arc::clone(&self.shutdown);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(store, stream, shutdown).await {
                            warn!(error = %e, "connection ended with error");
                        }
                    });
                }
                () = self.shutdown.notified() => {
                    info!("sandboxer shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve one coordinator connection until it hangs up or requests shutdown.
pub async fn handle_connection(
    store: Arc<SandboxStore>,
    mut stream: UnixStream,
    shutdown: Arc<Notify>,
) -> io::Result<()> {
    // Announce readiness; the coordinator replies with ping.
    let ready = encode(MSG_READY, 0, &[]).map_err(to_io_error)?;
    stream.write_all(&ready).await?;

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            // Coordinator hung up.
            return Ok(());
        }
        let messages = decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(to_io_error)?;
        for msg in messages {
            let response = handle_message(&store, &msg).await.map_err(to_io_error)?;
            stream.write_all(&response).await?;
            if msg.msg_type == MSG_SHUTDOWN {
                // notify_one stores a permit, so the accept loop sees the
                // request even if it is not parked on notified() right now.
                shutdown.notify_one();
                return Ok(());
            }
        }
    }
}

/// Dispatch one request and produce the encoded response frame.
async fn handle_message(
    store: &SandboxStore,
    msg: &RawMessage,
) -> Result<Vec<u8>, ProtocolError> {
    match msg.msg_type {
        MSG_PING => encode(MSG_PONG, msg.seq, &[]),
        MSG_SHUTDOWN => encode(MSG_SHUTDOWN_ACK, msg.seq, &[]),
        MSG_MATERIALIZE => {
            let payload = match sandboxer_proto::decode_materialize(&msg.payload) {
                Ok((raw_id, frames)) => {
                    let id = Uuid::from_bytes(raw_id);
                    let files: Vec<InputFile> = frames
                        .iter()
                        .map(|f| InputFile {
                            path: f.path.to_string(),
                            contents: f.contents.to_vec(),
                            executable: f.executable,
                        })
                        .collect();
                    match store.materialize(id, &files).await {
                        Ok(handle) => {
                            encode_materialize_result(true, handle.fingerprint.as_bytes(), "")
                        }
                        Err(e) => encode_materialize_result(
                            false,
                            &[0; FINGERPRINT_SIZE],
                            &e.to_string(),
                        ),
                    }
                }
                Err(e) => return encode(MSG_ERROR, msg.seq, &encode_error(&e.to_string())),
            };
            encode(MSG_MATERIALIZE_RESULT, msg.seq, &payload)
        }
        MSG_DISCARD => {
            let payload = match sandboxer_proto::decode_discard(&msg.payload) {
                Ok(raw_id) => match store.discard(Uuid::from_bytes(raw_id)).await {
                    Ok(()) => encode_discard_result(true, ""),
                    Err(e) => encode_discard_result(false, &e.to_string()),
                },
                Err(e) => return encode(MSG_ERROR, msg.seq, &encode_error(&e.to_string())),
            };
            encode(MSG_DISCARD_RESULT, msg.seq, &payload)
        }
        other => {
            warn!(msg_type = other, seq = msg.seq, "unknown message type");
            encode(
                MSG_ERROR,
                msg.seq,
                &encode_error(&format!("unknown message type 0x{other:02X}")),
            )
        }
    }
}
