//! Process submission API.
//!
//! Joins the two halves of the execution engine: the admission controller
//! (`admission`) gates how many concurrency units a process may hold, and
//! the materializer seam prepares its sandbox inputs, either in-process or
//! through the sandboxer sidecar. [`Executor::run`] takes a [`ProcessSpec`]
//! through the full pipeline and yields an [`ExecutionArtifact`].

mod config;
mod error;
mod executor;
mod materializer;
mod process;

pub use admission::Concurrency;
pub use sandboxer::InputFile;

pub use config::{ExecutorConfig, RetentionPolicy, SandboxerConfig, load};
pub use error::{ExecutorError, ExecutorResult};
pub use executor::Executor;
pub use materializer::{DirectMaterializer, InputMaterializer, SidecarMaterializer};
pub use process::{CONCURRENCY_TOKEN, ExecutionArtifact, ProcessSpec, rewrite_argv};
