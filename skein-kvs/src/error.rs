use skein::SkeinError;

pub type Result<T> = std::result::Result<T, KvsError>;

#[derive(Debug, thiserror::Error)]
pub enum KvsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,
}

impl From<KvsError> for SkeinError {
    fn from(e: KvsError) -> Self {
        match e {
            KvsError::NotFound { key } => SkeinError::KeyNotFound { key },
            KvsError::Io(io) => SkeinError::Io(io),
            other => SkeinError::bootstrap(format!("kvs: {other}")),
        }
    }
}
