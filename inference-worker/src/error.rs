use thiserror::Error;

use crate::source::SourceError;

/// Enumeration of errors that stop the worker loop. Anything below the
/// document level is folded into a terminal `ResultRecord` instead; only
/// infrastructure failures that would otherwise drop offset commits get to
/// escalate this far.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to publish results after {attempts} attempts: {reason}")]
    PublishFailed { attempts: u32, reason: String },
    #[error("failed to commit offsets: {0}")]
    CommitFailed(#[from] SourceError),
}
