use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use admission::Concurrency;
use sandboxer::{Fingerprint, InputFile};

/// Placeholder token in argv that is replaced with the granted unit count
/// after admission. `Range` processes use it to scale their own parallelism
/// (e.g. a compiler's `-j{execution_concurrency}` flag).
pub const CONCURRENCY_TOKEN: &str = "{execution_concurrency}";

/// Description of one process submission.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Human-readable description, used in logs.
    pub description: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub concurrency: Concurrency,
    /// Files materialized into the sandbox before the process starts.
    pub input_files: Vec<InputFile>,
    /// Wall-clock limit. Falls back to the configured default when `None`.
    pub timeout: Option<Duration>,
}

/// Replace the concurrency placeholder in each argument with the granted
/// unit count. Arguments without the token pass through unchanged.
///
/// This happens after admission, in the submitter, so the granted value is
/// final by the time it is substituted.
pub fn rewrite_argv(argv: &[String], granted_units: u32) -> Vec<String> {
    let granted = granted_units.to_string();
    argv.iter()
        .map(|arg| arg.replace(CONCURRENCY_TOKEN, &granted))
        .collect()
}

/// Outcome of one completed execution.
#[derive(Debug, Serialize)]
pub struct ExecutionArtifact {
    pub description: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,
    /// Concurrency units held while the process ran.
    pub granted_units: u32,
    /// Fingerprint of the materialized input file set.
    #[serde(serialize_with = "fingerprint_hex")]
    pub input_fingerprint: Fingerprint,
    /// Set when the retention policy kept the sandbox on disk.
    pub sandbox_path: Option<PathBuf>,
}

impl ExecutionArtifact {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn lossy_utf8<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

fn fingerprint_hex<S: serde::Serializer>(fp: &Fingerprint, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&fp.to_hex())
}
