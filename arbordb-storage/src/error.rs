use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt journal at address {address}: {reason}")]
    CorruptJournal { address: u64, reason: String },

    #[error("corrupt volume at page {address}: {reason}")]
    CorruptVolume { address: u64, reason: String },

    #[error("page {address} is in use")]
    InUse { address: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("state violation: {0}")]
    StateViolation(&'static str),

    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("value too long: {0} bytes")]
    ValueTooLong(usize),

    #[error("volume is read-only")]
    ReadOnly,

    #[error("tree not found: {0}")]
    TreeNotFound(String),
}

impl Error {
    pub fn corrupt_volume(address: u64, reason: impl Into<String>) -> Error {
        Error::CorruptVolume {
            address,
            reason: reason.into(),
        }
    }

    pub fn corrupt_journal(address: u64, reason: impl Into<String>) -> Error {
        Error::CorruptJournal {
            address,
            reason: reason.into(),
        }
    }
}
