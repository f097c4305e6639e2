use thiserror::Error;

/// Broad classes of failure, used by callers that only need to know
/// whether to retry, reconfigure, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad construction parameters. Never retried.
    Configuration,
    /// Disk or OS level failure. Fatal to the current transaction.
    Io,
    /// A structural invariant was found broken.
    Corruption,
    /// Misuse of the transaction API, or a failed commit.
    Transaction,
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid record length: expected {expected} bytes, got {actual}")]
    InvalidRecordLength { expected: usize, actual: usize },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of space: no free blocks available")]
    OutOfSpace,

    #[error("Invalid block ID: {0}")]
    InvalidBlockId(u64),

    #[error("Block {0} is already checked out for write")]
    BlockInUse(u64),

    #[error("No object at offset {0}")]
    InvalidOffset(u64),

    #[error("Structural corruption: {0}")]
    Corrupt(String),

    #[error("Journal corruption: {0}")]
    JournalCorrupt(String),

    #[error("No active writer slot: another write transaction is in progress")]
    WriterSlotBusy,

    #[error("Not in a transaction")]
    NotInTransaction,

    #[error("Write attempted in a read transaction")]
    ReadOnlyTransaction,

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Transaction coordinator has not been started")]
    NotStarted,

    #[error("Transaction coordinator has been shut down")]
    Shutdown,

    #[error("Transaction coordinator already started: configuration is frozen")]
    AlreadyStarted,

    #[error("Duplicate component id: {0}")]
    DuplicateComponent(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("A durable commit was not applied: restart to recover before writing")]
    RecoveryPending,

    #[error("Transaction coordinator is in exclusive mode")]
    ExclusiveMode,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl VaultError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            VaultError::Config(_)
            | VaultError::InvalidRecordLength { .. }
            | VaultError::InvalidBlockSize(_)
            | VaultError::ConfigParse(_) => ErrorCategory::Configuration,
            VaultError::Io(_)
            | VaultError::OutOfSpace
            | VaultError::InvalidBlockId(_)
            | VaultError::BlockInUse(_)
            | VaultError::InvalidOffset(_)
            | VaultError::Serialization(_) => ErrorCategory::Io,
            VaultError::Corrupt(_) | VaultError::JournalCorrupt(_) => ErrorCategory::Corruption,
            VaultError::WriterSlotBusy
            | VaultError::NotInTransaction
            | VaultError::ReadOnlyTransaction
            | VaultError::TransactionFinished
            | VaultError::NotStarted
            | VaultError::Shutdown
            | VaultError::AlreadyStarted
            | VaultError::DuplicateComponent(_)
            | VaultError::CommitFailed(_)
            | VaultError::RecoveryPending
            | VaultError::ExclusiveMode => ErrorCategory::Transaction,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        VaultError::Corrupt(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
