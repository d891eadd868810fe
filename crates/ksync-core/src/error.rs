use thiserror::Error;

pub type KsyncResult<T> = Result<T, KsyncError>;

#[derive(Debug, Error)]
pub enum KsyncError {
    #[error("secrets error: {0}")]
    Secrets(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("record error: {0}")]
    Record(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
