use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("bad id of length {0}")]
    BadId(usize),
    #[error("index {0} points to a missing record")]
    BadIndex(&'static str),
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    #[error("{var} must be at least {min} bytes long")]
    TooShort { var: &'static str, min: usize },
}
