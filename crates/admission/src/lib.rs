mod controller;
mod error;
mod requirement;

pub use controller::{AdmissionController, ExecutionSlot};
pub use error::{AdmissionError, Result};
pub use requirement::Concurrency;
