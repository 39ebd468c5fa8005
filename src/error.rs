//! Error types for the swap coordinator

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Main error type for swap flows and their host
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Cannot finish step {step} = {expected} when on step {current}")]
    StepMismatch {
        step: String,
        expected: u8,
        current: u8,
    },

    #[error("Unknown step {0}")]
    UnknownStep(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Peer channel error: {0}")]
    Peer(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Swap {0} not found")]
    SwapNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapError::Ledger(e) => e.is_retryable(),
            SwapError::Peer(_) | SwapError::Store(_) | SwapError::Database(_) => true,
            _ => false,
        }
    }

    /// Configuration errors abort flow construction
    pub fn is_fatal(&self) -> bool {
        matches!(self, SwapError::Config(_))
    }
}

/// Result type for swap operations
pub type SwapResult<T> = Result<T, SwapError>;

/// Failure categories reported by chain adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The same transaction was already broadcast or mined
    #[error("Transaction already known: {0}")]
    AlreadyKnown(String),

    /// The transaction executed and reverted (wrong or missing secret, spent output)
    #[error("Transaction execution failed: {0}")]
    ExecutionFailed(String),

    /// The caller cannot pay the network fee
    #[error("Insufficient funds for transaction fee: {0}")]
    InsufficientFee(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger rejected request: {0}")]
    Rejected(String),
}

lazy_static! {
    static ref ALREADY_KNOWN: Regex =
        Regex::new(r"(?i)known transaction|already known|already imported|txn-already-in-mempool")
            .expect("valid regex");
    static ref EXECUTION_FAILED: Regex =
        Regex::new(r"(?i)out of gas|execution reverted|revert|invalid opcode|script failed")
            .expect("valid regex");
    static ref INSUFFICIENT_FEE: Regex =
        Regex::new(r"(?i)insufficient funds|insufficient fee|fee too low|min relay fee")
            .expect("valid regex");
    static ref UNAVAILABLE: Regex =
        Regex::new(r"(?i)timeout|timed out|connection|unavailable|rate limit|503|502")
            .expect("valid regex");
}

impl LedgerError {
    /// Map a raw node/wallet error message onto a known category
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();

        if ALREADY_KNOWN.is_match(&message) {
            LedgerError::AlreadyKnown(message)
        } else if INSUFFICIENT_FEE.is_match(&message) {
            LedgerError::InsufficientFee(message)
        } else if EXECUTION_FAILED.is_match(&message) {
            LedgerError::ExecutionFailed(message)
        } else if UNAVAILABLE.is_match(&message) {
            LedgerError::Unavailable(message)
        } else {
            LedgerError::Rejected(message)
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::InsufficientFee(_))
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            LedgerError::AlreadyKnown(_) => "already_known",
            LedgerError::ExecutionFailed(_) => "execution_failed",
            LedgerError::InsufficientFee(_) => "insufficient_fee",
            LedgerError::Unavailable(_) => "unavailable",
            LedgerError::Rejected(_) => "rejected",
        }
    }
}

/// Result type for chain adapter calls
pub type LedgerResult<T> = Result<T, LedgerError>;
