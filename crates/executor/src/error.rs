use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("admission: {0}")]
    Admission(#[from] admission::AdmissionError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] sandboxer::SandboxerError),

    #[error("sandboxer client: {0}")]
    Sidecar(#[from] sandboxer_client::ClientError),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid process spec: {0}")]
    Spec(String),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
