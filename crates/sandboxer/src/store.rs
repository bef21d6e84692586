//! Sandbox registry and materialization state machine.
//!
//! Per sandbox: `Empty → Materializing → Ready → (Executing → Completed) |
//! Discarded`, with `Discarded` reachable from any state on explicit
//! teardown. Only `Ready` sandboxes may be handed to execution.
//!
//! The registry lock is held only for lookups; each sandbox carries its own
//! async lock, so concurrent materialization of distinct sandboxes proceeds
//! independently while requests for the same sandbox serialize. Discarding a
//! sandbox removes its record entirely, so a long-lived store tracks only
//! live sandboxes.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxerError};
use crate::fingerprint::Fingerprint;

/// Lifecycle state of one sandbox directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Empty,
    Materializing,
    Ready,
    Executing,
    Completed,
    Discarded,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Empty => "empty",
            SandboxState::Materializing => "materializing",
            SandboxState::Ready => "ready",
            SandboxState::Executing => "executing",
            SandboxState::Completed => "completed",
            SandboxState::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// One declared process input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Sandbox-relative destination path. Absolute paths and `..` components
    /// are rejected at materialization time.
    pub path: String,
    pub contents: Vec<u8>,
    pub executable: bool,
}

/// A prepared sandbox: directory tree plus the fingerprint of its inputs.
///
/// Owned by the process the sandbox was prepared for until released
/// (deleted or retained for inspection) after the process terminates.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: Uuid,
    pub root: PathBuf,
    pub fingerprint: Fingerprint,
}

struct Record {
    fingerprint: Option<Fingerprint>,
}

/// Registry entry for one sandbox.
///
/// The async `record` lock serializes operations on the sandbox; the state
/// cell is a plain mutex so `state()` lookups never touch the operation
/// lock. State writes happen only while the record lock is held.
struct Entry {
    state: Mutex<SandboxState>,
    record: AsyncMutex<Record>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: Mutex::new(SandboxState::Empty),
            record: AsyncMutex::new(Record { fingerprint: None }),
        }
    }

    fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SandboxState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Registry of sandboxes under one root directory.
pub struct SandboxStore {
    root: PathBuf,
    sandboxes: Mutex<HashMap<Uuid, Arc<Entry>>>,
}

impl SandboxStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Directory a sandbox materializes into.
    pub fn sandbox_root(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Current state of a sandbox, if the store tracks it.
    pub fn state(&self, id: Uuid) -> Option<SandboxState> {
        self.lock_registry().get(&id).map(|entry| entry.state())
    }

    /// Number of sandboxes the registry currently tracks.
    pub fn tracked(&self) -> usize {
        self.lock_registry().len()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Entry>>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_entry(&self, id: Uuid) -> Arc<Entry> {
        let mut records = self.lock_registry();
        Arc::clone(records.entry(id).or_insert_with(|| Arc::new(Entry::new())))
    }

    fn existing_record(&self, id: Uuid) -> Result<Arc<Entry>> {
        self.lock_registry()
            .get(&id)
            .map(Arc::clone)
            .ok_or(SandboxerError::Unknown(id))
    }

    /// Write every input file into the sandbox, returning only once all
    /// writers are closed.
    ///
    /// Idempotent: an identical file set against a `Ready` sandbox returns
    /// the existing handle without touching disk. A differing set is a
    /// conflict — sandboxes are exclusively owned by one process execution.
    pub async fn materialize(&self, id: Uuid, files: &[InputFile]) -> Result<SandboxHandle> {
        for file in files {
            validate_relative_path(&file.path)?;
        }
        let fingerprint = Fingerprint::of_files(files);
        let root = self.sandbox_root(id);
        let entry = self.record_entry(id);
        let mut rec = entry.record.lock().await;

        match entry.state() {
            SandboxState::Empty => {}
            SandboxState::Ready => {
                return if rec.fingerprint == Some(fingerprint) {
                    debug!(sandbox = %id, %fingerprint, "already materialized, no-op");
                    Ok(SandboxHandle {
                        id,
                        root,
                        fingerprint,
                    })
                } else {
                    Err(SandboxerError::Conflict { id })
                };
            }
            state => {
                return Err(SandboxerError::InvalidState {
                    id,
                    state,
                    action: "materialize",
                });
            }
        }

        entry.set_state(SandboxState::Materializing);
        info!(sandbox = %id, files = files.len(), %fingerprint, "materializing");
        match write_files(&root, files).await {
            Ok(()) => {
                entry.set_state(SandboxState::Ready);
                rec.fingerprint = Some(fingerprint);
                debug!(sandbox = %id, "ready");
                Ok(SandboxHandle {
                    id,
                    root,
                    fingerprint,
                })
            }
            Err(e) => {
                warn!(sandbox = %id, error = %e, "materialization failed, discarding");
                entry.set_state(SandboxState::Discarded);
                if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                    debug!(sandbox = %id, error = %e, "cleanup after failed materialization");
                }
                drop(rec);
                self.lock_registry().remove(&id);
                Err(e)
            }
        }
    }

    /// Hand a `Ready` sandbox to execution.
    pub async fn mark_executing(&self, id: Uuid) -> Result<()> {
        self.transition(id, SandboxState::Ready, SandboxState::Executing, "execute")
            .await
    }

    /// Record that the executing process terminated.
    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        self.transition(
            id,
            SandboxState::Executing,
            SandboxState::Completed,
            "complete",
        )
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: SandboxState,
        to: SandboxState,
        action: &'static str,
    ) -> Result<()> {
        let entry = self.existing_record(id)?;
        let _rec = entry.record.lock().await;
        let state = entry.state();
        if state != from {
            return Err(SandboxerError::InvalidState { id, state, action });
        }
        entry.set_state(to);
        Ok(())
    }

    /// Tear a sandbox down, deleting its directory tree and dropping its
    /// registry record. Discarding an unknown or already-discarded sandbox
    /// is a no-op.
    pub async fn discard(&self, id: Uuid) -> Result<()> {
        let Some(entry) = self.lock_registry().get(&id).map(Arc::clone) else {
            return Ok(());
        };
        let rec = entry.record.lock().await;

        let result = if entry.state() == SandboxState::Discarded {
            Ok(())
        } else {
            entry.set_state(SandboxState::Discarded);
            match tokio::fs::remove_dir_all(self.sandbox_root(id)).await {
                Ok(()) => {
                    info!(sandbox = %id, "discarded");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        };

        drop(rec);
        self.lock_registry().remove(&id);
        result
    }
}

fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SandboxerError::InvalidPath {
            path: path.to_string(),
            reason: "empty path",
        });
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(SandboxerError::InvalidPath {
            path: path.to_string(),
            reason: "absolute path escapes the sandbox",
        });
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(SandboxerError::InvalidPath {
                    path: path.to_string(),
                    reason: "path escapes the sandbox",
                });
            }
        }
    }
    Ok(())
}

async fn write_files(root: &Path, files: &[InputFile]) -> Result<()> {
    tokio::fs::create_dir_all(root).await?;
    for file in files {
        let dest = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, &file.contents).await?;
        #[cfg(unix)]
        if file.executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).await?;
        }
    }
    Ok(())
}
