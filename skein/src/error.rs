use crate::types::Rank;

/// Convenience alias used throughout skein.
pub type Result<T> = std::result::Result<T, SkeinError>;

/// Recoverable transport errors.
///
/// Internal-consistency violations are not represented here: they go through
/// [`fatal!`](crate::fault) and never return to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SkeinError {
    #[error("can't find suitable provider: {reason}")]
    NoSuitableProvider { reason: String },

    #[error("bootstrap failed: {reason}")]
    Bootstrap { reason: String },

    #[error("rendezvous key not found: {key}")]
    KeyNotFound { key: String },

    #[error("rendezvous value for {key}: expected {expected} bytes, got {actual}")]
    ValueSizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("shared memory segment {path}: {reason}")]
    SharedMemory { path: String, reason: String },

    #[error("failed to retrieve hostname: {reason}")]
    Hostname { reason: String },

    #[error("provider {prov}: {reason}")]
    Provider { prov: String, reason: String },

    #[error("unknown peer rank {rank}")]
    UnknownPeer { rank: Rank },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport is already finalized")]
    AlreadyFinalized,

    #[error("codec: {0}")]
    Codec(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SkeinError {
    pub fn bootstrap(reason: impl Into<String>) -> Self {
        Self::Bootstrap {
            reason: reason.into(),
        }
    }

    pub fn provider(prov: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provider {
            prov: prov.into(),
            reason: reason.into(),
        }
    }

    pub fn no_provider(reason: impl Into<String>) -> Self {
        Self::NoSuitableProvider {
            reason: reason.into(),
        }
    }

    pub fn shared_memory(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::SharedMemory {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Status code returned by the public operation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Failure = 1,
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    /// Collapse a `Result`, logging the error on the way.
    pub fn from_result<T>(op: &str, res: &Result<T>) -> Self {
        match res {
            Ok(_) => Status::Success,
            Err(e) => {
                tracing::error!(op, "{e}");
                Status::Failure
            }
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => f.write_str("SUCCESS"),
            Status::Failure => f.write_str("FAILURE"),
        }
    }
}
