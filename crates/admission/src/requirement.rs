use crate::error::{AdmissionError, Result};

/// Declared concurrency requirement for one process execution.
///
/// Attached to a process at submission time and consumed exactly once by the
/// admission controller when the process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// The process must be the only one executing system-wide.
    Exclusive,
    /// The process requires exactly `n` resource units for its duration.
    Exactly(u32),
    /// The process accepts any unit count in `[min, max]`. The granted value
    /// is reported on the execution slot; the submitter substitutes it into
    /// its own argument list.
    Range { min: u32, max: u32 },
}

impl Concurrency {
    /// Check structural validity (positive values, `min <= max`).
    pub fn validate(&self) -> Result<()> {
        match *self {
            Concurrency::Exclusive => Ok(()),
            Concurrency::Exactly(0) => Err(AdmissionError::InvalidRequirement(
                "exactly(0) requests no units".to_string(),
            )),
            Concurrency::Exactly(_) => Ok(()),
            Concurrency::Range { min: 0, .. } => Err(AdmissionError::InvalidRequirement(
                "range minimum must be at least 1".to_string(),
            )),
            Concurrency::Range { min, max } if min > max => Err(AdmissionError::InvalidRequirement(
                format!("range minimum {min} exceeds maximum {max}"),
            )),
            Concurrency::Range { .. } => Ok(()),
        }
    }

    /// The smallest unit count that could ever satisfy this requirement.
    ///
    /// `Exclusive` needs the whole pool but is satisfiable on any non-empty
    /// pool, so its minimum is 1.
    pub fn min_units(&self) -> u32 {
        match *self {
            Concurrency::Exclusive => 1,
            Concurrency::Exactly(n) => n,
            Concurrency::Range { min, .. } => min,
        }
    }
}

impl std::fmt::Display for Concurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Concurrency::Exclusive => write!(f, "exclusive"),
            Concurrency::Exactly(n) => write!(f, "exactly({n})"),
            Concurrency::Range { min, max } => write!(f, "range({min},{max})"),
        }
    }
}
