//! Error types for wallet core operations
//!
//! Validation errors (wrong color count, bad seed, duplicate txid) are raised
//! before any state is touched. Errors surfacing from a queued operation cause
//! the whole working snapshot to be discarded by the state manager.

use bitcoin::{OutPoint, Txid};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Transaction already exists: {0}")]
    AlreadyExists(Txid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Coin not found: {0}")]
    CoinNotFound(OutPoint),

    #[error("Multi-color transactions are not supported: {0}")]
    MultiColorNotSupported(String),

    #[error("Multi-asset transactions are not supported: {0}")]
    MultiAssetTransactionNotSupported(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("No composer registered for color kind: {0}")]
    ComposerFunctionNotFound(String),

    #[error("Cyclic graph detected in history at {0}")]
    CyclicGraph(Txid),

    #[error("Transaction kind not recognized: {0}")]
    TxKindNotRecognized(String),

    #[error("Target kind {target} not reachable from {current}")]
    TargetKindNotReachable { current: String, target: String },

    #[error("Seed does not match previously derived addresses")]
    VerifySeedHex,

    #[error("Invalid color descriptor: {0}")]
    InvalidColorDesc(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<reqwest::Error> for WalletError {
    fn from(err: reqwest::Error) -> Self {
        WalletError::Backend(err.to_string())
    }
}

impl From<bitcoin::consensus::encode::FromHexError> for WalletError {
    fn from(err: bitcoin::consensus::encode::FromHexError) -> Self {
        WalletError::Bitcoin(err.to_string())
    }
}

impl WalletError {
    /// Create a not-found error for a transaction
    pub fn tx_not_found(txid: &Txid) -> Self {
        Self::NotFound(format!("transaction {}", txid))
    }

    /// Create a not-reachable error from two stage names
    pub fn not_reachable(current: impl Into<String>, target: impl Into<String>) -> Self {
        Self::TargetKindNotReachable {
            current: current.into(),
            target: target.into(),
        }
    }
}
