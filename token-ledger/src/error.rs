//! Error types for the token ledger

use crate::types::{AccountBookId, AddressId, Amount, DebitOperation, TokenId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Token ID does not exist
    #[error("Token not found: {0}")]
    TokenNotFound(TokenId),

    /// No token carries the symbol
    #[error("Token symbol not found: {0}")]
    SymbolNotFound(String),

    /// Account book ID does not exist
    #[error("Account book not found: {0}")]
    AccountBookNotFound(AccountBookId),

    /// Token exists but lives in another account book
    #[error("Token {symbol} not found in account book {account_book_id}")]
    TokenNotInAccountBook {
        /// Requested symbol
        symbol: String,
        /// Requested account book
        account_book_id: AccountBookId,
    },

    /// Unique constraint on symbol
    #[error("Token already exists: {0}")]
    SymbolAlreadyExists(String),

    /// Debit larger than the available balance
    #[error("{operation} amount exceeds balance: attempted {attempted}, available {available}")]
    InsufficientBalance {
        /// Rejected operation
        operation: DebitOperation,
        /// Debited address
        address: AddressId,
        /// Requested amount
        attempted: Amount,
        /// Balance at the time of the check
        available: Amount,
    },

    /// Zero or negative amount
    #[error("Invalid amount: {0} (must be positive)")]
    InvalidAmount(Amount),

    /// Result would not fit in a 64-bit balance or supply
    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store I/O or transaction failure
    #[error("Database error during {context}: {source}")]
    Persistence {
        /// What the ledger was doing
        context: String,
        /// Root cause
        #[source]
        source: sqlx::Error,
    },

    /// Schema migration failure
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Operation cancelled before commit
    #[error("Operation cancelled before commit")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error classification for callers deciding between retry and reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referenced token, symbol or account book is missing
    NotFound,
    /// Uniqueness violation
    Conflict,
    /// Business rule: funds inadequate
    InsufficientBalance,
    /// Business rule: malformed input
    Validation,
    /// Infrastructure failure
    Persistence,
    /// Caller cancelled the operation
    Cancelled,
    /// Bad configuration
    Configuration,
}

impl LedgerError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::TokenNotFound(_)
            | LedgerError::SymbolNotFound(_)
            | LedgerError::AccountBookNotFound(_)
            | LedgerError::TokenNotInAccountBook { .. } => ErrorKind::NotFound,
            LedgerError::SymbolAlreadyExists(_) => ErrorKind::Conflict,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::InvalidAmount(_)
            | LedgerError::AmountOverflow(_)
            | LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::Persistence { .. } | LedgerError::Migration(_) => ErrorKind::Persistence,
            LedgerError::Cancelled => ErrorKind::Cancelled,
            LedgerError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Infrastructure failures may succeed on retry; rule violations never will
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Persistence | ErrorKind::Cancelled)
    }

    /// Short machine-readable label, used as a log field
    pub fn error_type(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "duplicate_error",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Persistence => "database_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "config_error",
        }
    }

    /// Wrap a store failure with the operation it interrupted
    pub(crate) fn persistence(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| LedgerError::Persistence { context, source }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for LedgerError {
    fn from(err: validator::ValidationErrors) -> Self {
        LedgerError::Validation(err.to_string())
    }
}
