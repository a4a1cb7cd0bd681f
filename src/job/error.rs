//! Job sequencer error types.

use thiserror::Error;

/// Errors raised by the job driver itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Every queued step ran but none of them settled the job.
    #[error("job '{flow}' finished without an outcome")]
    Stalled { flow: &'static str },
}
