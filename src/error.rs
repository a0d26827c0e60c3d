//! Error types for AssetLedger

use crate::permissions::PermissionRole;
use crate::transaction::OutPoint;
use std::fmt;

/// Storage, IO and serialization failures shared across the crate.
#[derive(Debug, Clone)]
pub enum ChainError {
    DatabaseError(String),
    CryptoError(String),
    WalletError(String),
    ConfigError(String),
    IoError(String),
    BincodeError(String),
    InvalidTransaction(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::WalletError(msg) => write!(f, "Wallet error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

/// Diagnostic appended when coins were skipped for carrying inline metadata.
pub const INLINE_METADATA_NOTE: &str =
    "Some outputs carrying inline metadata were not used. Unlock them with -lockinlinemetadata=0";

/// Reason given when the only coins that could cover a shortfall lack send permission.
pub const NO_SEND_COINS_REASON: &str =
    "Insufficient funds, but there are coins belonging to addresses without send permission";

/// Failures of a transaction build. A build either returns a complete
/// transaction or exactly one of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Insufficient permissions ({role}): {reason}")]
    InsufficientPermissions { role: PermissionRole, reason: String },

    #[error("No unspent outputs: {0}")]
    NoUnspentOutputs(String),

    #[error("Change address not found")]
    ChangeAddressNotFound,

    #[error("Transaction too large: {0}")]
    TransactionTooLarge(String),

    #[error("Non-standard output: {0}")]
    NonStandardOutput(String),

    #[error("Not enough inputs: found {found}, required {required}")]
    NotEnoughInputs { found: usize, required: usize },

    #[error("Internal error: {0}")]
    InternalInvariantViolation(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Could not find pre-selected output {0}")]
    PreselectedCoinNotFound(OutPoint),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Storage(#[from] ChainError),
}

impl SelectionError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        SelectionError::InternalInvariantViolation(msg.into())
    }

    /// Appends the inline-metadata note to the reason of shortfall errors.
    pub(crate) fn with_inline_note(self, inline_coins: bool) -> Self {
        if !inline_coins {
            return self;
        }
        let append = |reason: String| format!("{}. {}", reason, INLINE_METADATA_NOTE);
        match self {
            SelectionError::InsufficientFunds(r) => SelectionError::InsufficientFunds(append(r)),
            SelectionError::NoUnspentOutputs(r) => SelectionError::NoUnspentOutputs(append(r)),
            SelectionError::InsufficientPermissions { role, reason } => {
                SelectionError::InsufficientPermissions {
                    role,
                    reason: append(reason),
                }
            }
            other => other,
        }
    }
}

pub type SelectionResult<T> = std::result::Result<T, SelectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_display() {
        let err = ChainError::DatabaseError("locked".to_string());
        assert_eq!(err.to_string(), "Database error: locked");
    }

    #[test]
    fn test_storage_error_converts() {
        let err: SelectionError = ChainError::WalletError("gone".to_string()).into();
        assert!(matches!(err, SelectionError::Storage(_)));
        assert_eq!(err.to_string(), "Wallet error: gone");
    }

    #[test]
    fn test_inline_note_appended_only_when_flagged() {
        let err = SelectionError::InsufficientFunds("short".to_string());
        assert_eq!(err.clone().with_inline_note(false).to_string(), "Insufficient funds: short");
        assert!(err
            .with_inline_note(true)
            .to_string()
            .contains("inline metadata"));
    }
}
