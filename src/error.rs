use thiserror::Error;

#[derive(Error, Debug)]
pub enum VdoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device is read-only")]
    ReadOnly,

    #[error("device is shutting down")]
    ShuttingDown,

    #[error("logical block {0} out of range (logical size {1})")]
    OutOfRange(u64, u64),

    #[error("out of physical space")]
    OutOfSpace,

    #[error("corrupt journal block: {0}")]
    CorruptJournal(String),

    #[error("corrupt metadata page: {0}")]
    CorruptPage(String),

    #[error("rebuild required: {0}")]
    RebuildRequired(String),

    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("invalid compressed fragment")]
    InvalidFragment,

    #[error("invalid admin state transition: {0}")]
    InvalidAdminState(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("nonce mismatch: expected {expected:#x}, found {found:#x}")]
    NonceMismatch { expected: u64, found: u64 },

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("device already exists: {0}")]
    DeviceExists(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VdoError>;

impl VdoError {
    /// Whether an error on a metadata write path must drive the whole device
    /// into read-only mode.
    pub fn is_read_only_trigger(&self) -> bool {
        matches!(
            self,
            VdoError::Io(_)
                | VdoError::CorruptJournal(_)
                | VdoError::CorruptPage(_)
                | VdoError::ChecksumMismatch(_)
        )
    }
}
