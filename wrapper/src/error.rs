use std::path::PathBuf;

use thiserror::Error;

/// Failure classes of the wrapper itself.
///
/// `Validation` and `Privilege` can only occur before the bootstrap
/// line is emitted and abort the process with a message on stderr.
/// `Spawn` and `Persistence` occur after detaching, where no caller is
/// listening anymore; they are reported through the wrapper log and,
/// where classifiable, the state file. An unsuccessful conversion is
/// deliberately *not* an error variant: it is ordinary data recorded in
/// the state file.
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("invalid job request: {0}")]
    Validation(String),

    #[error("cannot assume identity '{account}': {reason}")]
    Privilege { account: String, reason: String },

    #[error("failed to start conversion process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to persist state file {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
