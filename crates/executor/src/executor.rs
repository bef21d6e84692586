use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time;
use tracing::{info, warn};
use uuid::Uuid;

use admission::AdmissionController;
use sandboxer::SandboxHandle;

use crate::config::{ExecutorConfig, RetentionPolicy};
use crate::error::{ExecutorError, ExecutorResult};
use crate::materializer::{DirectMaterializer, InputMaterializer, SidecarMaterializer};
use crate::process::{ExecutionArtifact, ProcessSpec, rewrite_argv};

/// Ties admission and materialization together: one `run` call takes a
/// [`ProcessSpec`] through materialize → admit → spawn → release → retain.
pub struct Executor {
    admission: AdmissionController,
    materializer: Arc<dyn InputMaterializer>,
    retention: RetentionPolicy,
    default_timeout: Duration,
}

impl Executor {
    /// Build an executor from a validated config.
    ///
    /// With `sandboxer.enabled` the sidecar client is used for all sandbox
    /// writes; an unreachable sidecar then fails the dependent execution.
    pub fn from_config(config: &ExecutorConfig) -> ExecutorResult<Self> {
        config.validate()?;
        let materializer: Arc<dyn InputMaterializer> = match (
            config.sandboxer.enabled,
            config.sandboxer.socket.clone(),
        ) {
            (true, Some(socket)) => {
                Arc::new(SidecarMaterializer::new(socket, config.sandbox_root.clone()))
            }
            (true, None) => {
                return Err(ExecutorError::Config(
                    "sandboxer.socket is required when sandboxer.enabled is true".into(),
                ));
            }
            (false, _) => Arc::new(DirectMaterializer::new(config.sandbox_root.clone())),
        };
        Ok(Self::new(
            AdmissionController::new(config.total_units),
            materializer,
            config.keep_sandboxes,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn new(
        admission: AdmissionController,
        materializer: Arc<dyn InputMaterializer>,
        retention: RetentionPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            materializer,
            retention,
            default_timeout,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Run one process to completion.
    ///
    /// Inputs are materialized before admission is requested, so a queued
    /// process starts the moment its units are granted. The concurrency
    /// placeholder in argv is rewritten with the granted count after the
    /// grant, never before.
    pub async fn run(&self, spec: ProcessSpec) -> ExecutorResult<ExecutionArtifact> {
        if spec.argv.is_empty() {
            return Err(ExecutorError::Spec("argv must not be empty".into()));
        }
        spec.concurrency.validate()?;

        let id = Uuid::new_v4();
        info!(id = %id, description = %spec.description, files = spec.input_files.len(), "materializing inputs");
        let handle = self.materializer.materialize(id, &spec.input_files).await?;

        let slot = match self.admission.submit(spec.concurrency).await {
            Ok(slot) => slot,
            Err(e) => {
                // The sandbox will never run; don't leave it on disk.
                if let Err(discard_err) = self.materializer.discard(id).await {
                    warn!(id = %id, error = %discard_err, "discard after admission failure failed");
                }
                return Err(e.into());
            }
        };
        let granted = slot.granted_units();
        info!(id = %id, granted, concurrency = %spec.concurrency, "admitted");

        let argv = rewrite_argv(&spec.argv, granted);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutorError::Spec("argv must not be empty".into()));
        };

        if let Err(e) = self.materializer.mark_executing(id).await {
            // Same as an admission failure: nothing ran, so the sandbox goes.
            drop(slot);
            if let Err(discard_err) = self.materializer.discard(id).await {
                warn!(id = %id, error = %discard_err, "discard after failed executing transition failed");
            }
            return Err(e);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&handle.root)
            .kill_on_drop(true);

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let output = match time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                drop(slot);
                self.finish(id, &handle, false).await;
                return Err(ExecutorError::Spawn(e));
            }
            Err(_) => {
                // Dropping the output future kills the child (kill_on_drop).
                drop(slot);
                warn!(id = %id, ?timeout, "process timed out");
                self.finish(id, &handle, false).await;
                return Err(ExecutorError::Timeout(timeout));
            }
        };

        // Units go back to the pool before sandbox cleanup, which can be slow.
        drop(slot);

        let success = output.status.success();
        let sandbox_path = self.finish(id, &handle, success).await;
        info!(id = %id, exit_code = ?output.status.code(), "process finished");

        Ok(ExecutionArtifact {
            description: spec.description,
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            granted_units: granted,
            input_fingerprint: handle.fingerprint,
            sandbox_path,
        })
    }

    /// Mark the sandbox completed and apply the retention policy.
    ///
    /// Returns the sandbox path when it was kept. Cleanup failures are
    /// logged, not surfaced; the execution outcome stands.
    async fn finish(&self, id: Uuid, handle: &SandboxHandle, success: bool) -> Option<PathBuf> {
        if let Err(e) = self.materializer.mark_completed(id).await {
            warn!(id = %id, error = %e, "failed to mark sandbox completed");
        }

        let keep = match self.retention {
            RetentionPolicy::Always => true,
            RetentionPolicy::OnFailure => !success,
            RetentionPolicy::Never => false,
        };
        if keep {
            info!(id = %id, path = %handle.root.display(), "retaining sandbox");
            return Some(handle.root.clone());
        }
        if let Err(e) = self.materializer.discard(id).await {
            warn!(id = %id, error = %e, "sandbox discard failed");
        }
        None
    }
}
