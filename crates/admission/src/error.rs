#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The requirement can never be satisfied on this controller, regardless
    /// of what is currently running. Surfaced to the submitter as a
    /// configuration error and never retried.
    #[error("requirement needs {required} units but the pool only has {total}")]
    Unsatisfiable { required: u32, total: u32 },

    #[error("invalid concurrency requirement: {0}")]
    InvalidRequirement(String),

    /// The controller was dropped while this submission was still pending.
    #[error("admission controller closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
