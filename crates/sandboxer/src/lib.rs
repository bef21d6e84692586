//! Sandbox materialization sidecar.
//!
//! Provides the on-disk sandbox store (state machine, fingerprinting,
//! file writing) and the Unix-socket server that exposes it to the
//! execution coordinator. The coordinator talks to this process through
//! `sandboxer-client`; it never writes sandbox files itself.

mod error;
mod fingerprint;
mod server;
mod store;

pub use error::{Result, SandboxerError};
pub use fingerprint::Fingerprint;
pub use server::{SandboxerServer, handle_connection};
pub use store::{InputFile, SandboxHandle, SandboxState, SandboxStore};
