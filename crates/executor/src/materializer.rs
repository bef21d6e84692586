use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use sandboxer::{Fingerprint, InputFile, SandboxHandle, SandboxStore};
use sandboxer_client::SandboxerClient;
use sandboxer_proto::FileFrame;

use crate::error::ExecutorResult;

const SIDECAR_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam between the executor and whatever writes sandbox input files.
///
/// Two implementations: [`DirectMaterializer`] writes in-process,
/// [`SidecarMaterializer`] delegates to the sandboxer sidecar so the
/// executing process never holds a write descriptor on its own inputs.
#[async_trait]
pub trait InputMaterializer: Send + Sync {
    async fn materialize(&self, id: Uuid, files: &[InputFile]) -> ExecutorResult<SandboxHandle>;

    /// Record that the sandbox's process has started.
    async fn mark_executing(&self, id: Uuid) -> ExecutorResult<()>;

    /// Record that the sandbox's process has terminated.
    async fn mark_completed(&self, id: Uuid) -> ExecutorResult<()>;

    /// Tear the sandbox down and delete its directory.
    async fn discard(&self, id: Uuid) -> ExecutorResult<()>;
}

/// In-process materialization over a local [`SandboxStore`].
pub struct DirectMaterializer {
    store: Arc<SandboxStore>,
}

impl DirectMaterializer {
    pub fn new(sandbox_root: PathBuf) -> Self {
        Self {
            store: Arc::new(SandboxStore::new(sandbox_root)),
        }
    }
}

#[async_trait]
impl InputMaterializer for DirectMaterializer {
    async fn materialize(&self, id: Uuid, files: &[InputFile]) -> ExecutorResult<SandboxHandle> {
        Ok(self.store.materialize(id, files).await?)
    }

    async fn mark_executing(&self, id: Uuid) -> ExecutorResult<()> {
        Ok(self.store.mark_executing(id).await?)
    }

    async fn mark_completed(&self, id: Uuid) -> ExecutorResult<()> {
        Ok(self.store.mark_completed(id).await?)
    }

    async fn discard(&self, id: Uuid) -> ExecutorResult<()> {
        Ok(self.store.discard(id).await?)
    }
}

/// Materialization through the sandboxer sidecar.
///
/// The connection is established lazily on first use and reused afterwards.
/// An unreachable sidecar is a hard error for the dependent execution; there
/// is no fallback to in-process writes, since that would reintroduce the
/// text-busy race this component exists to prevent.
pub struct SidecarMaterializer {
    socket: PathBuf,
    /// Sandbox root shared with the sidecar (both sides see the same tree).
    sandbox_root: PathBuf,
    client: Mutex<Option<SandboxerClient>>,
}

impl SidecarMaterializer {
    pub fn new(socket: PathBuf, sandbox_root: PathBuf) -> Self {
        Self {
            socket,
            sandbox_root,
            client: Mutex::new(None),
        }
    }

    /// Lock the connection slot, connecting first if needed.
    async fn connected(&self) -> ExecutorResult<MutexGuard<'_, Option<SandboxerClient>>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = SandboxerClient::connect(&self.socket, SIDECAR_CONNECT_TIMEOUT).await?;
            *guard = Some(client);
        }
        Ok(guard)
    }

    /// Drop the cached connection after a transport error so the next
    /// request reconnects instead of reusing a broken stream.
    fn handle_result<T>(
        guard: &mut MutexGuard<'_, Option<SandboxerClient>>,
        result: sandboxer_client::Result<T>,
    ) -> ExecutorResult<T> {
        if matches!(result, Err(sandboxer_client::ClientError::Io(_))) {
            **guard = None;
        }
        Ok(result?)
    }
}

#[async_trait]
impl InputMaterializer for SidecarMaterializer {
    async fn materialize(&self, id: Uuid, files: &[InputFile]) -> ExecutorResult<SandboxHandle> {
        let frames: Vec<FileFrame<'_>> = files
            .iter()
            .map(|f| FileFrame {
                path: &f.path,
                contents: &f.contents,
                executable: f.executable,
            })
            .collect();

        let mut guard = self.connected().await?;
        let result = match guard.as_mut() {
            Some(client) => client.materialize(id, &frames).await,
            None => return Err(not_connected(&self.socket)),
        };
        let fingerprint = Self::handle_result(&mut guard, result)?;
        debug!(id = %id, "sidecar materialized sandbox");

        Ok(SandboxHandle {
            id,
            root: self.sandbox_root.join(id.to_string()),
            fingerprint: Fingerprint::from_bytes(fingerprint),
        })
    }

    // The sidecar's involvement ends once the sandbox is ready; execution
    // state is tracked on the coordinator side only.
    async fn mark_executing(&self, _id: Uuid) -> ExecutorResult<()> {
        Ok(())
    }

    async fn mark_completed(&self, _id: Uuid) -> ExecutorResult<()> {
        Ok(())
    }

    async fn discard(&self, id: Uuid) -> ExecutorResult<()> {
        let mut guard = self.connected().await?;
        let result = match guard.as_mut() {
            Some(client) => client.discard(id).await,
            None => return Err(not_connected(&self.socket)),
        };
        Self::handle_result(&mut guard, result)
    }
}

fn not_connected(socket: &std::path::Path) -> crate::error::ExecutorError {
    sandboxer_client::ClientError::Unavailable {
        socket: socket.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected"),
    }
    .into()
}
