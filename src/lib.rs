//! cc-wallet-core: sync and transaction lifecycle for a colored-coin wallet
//!
//! Turns an asynchronous, possibly reordered, possibly reverted stream of
//! blockchain observations into a consistent local view of which coins the
//! wallet owns, in which asset, and what happened.
//!
//! # Architecture
//!
//! - **Ledger**: transaction records and the status state machine
//! - **Coin Tracker**: UTXO/spend/freeze indexes derived from the ledger
//! - **History Builder**: per-transaction activity entries in causal order
//! - **State Manager**: serialized execution queue over immutable snapshots,
//!   persistence and signal delivery
//! - **Transform Pipeline**: asset targets to a signed transaction
//!
//! # Example
//!
//! ```ignore
//! use cc_wallet_core::{Wallet, WalletConfig};
//!
//! let wallet = Wallet::open(WalletConfig::from_env()).await?;
//! let address = wallet.get_new_address("bitcoin", &seed).await?;
//! wallet.sync_all().await?;
//! let balance = wallet.get_balance("bitcoin")?;
//! ```

// Public modules
pub mod address;
pub mod asset;
pub mod backend;
pub mod coins;
pub mod color;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod manager;
pub mod signal;
pub mod state;
pub mod storage;
pub mod tx;
pub mod wallet;

// Re-exports for convenience
pub use address::{AddressManager, HdAddressManager};
pub use asset::{AssetDefinition, AssetRegistry, AssetTarget, AssetValue};
pub use backend::{Backend, EsploraBackend, HistoryItem};
pub use coins::{CoinList, CoinQuery, CoinRecord, CoinTracker, FreezeOptions};
pub use color::{ColorDefinition, ColorOracle, ColorTarget, ColorValue, UncoloredOracle};
pub use config::{StateConfig, WalletConfig};
pub use error::{StorageError, WalletError};
pub use history::{EntryType, HistoryBuilder, HistoryEntry};
pub use ledger::{Ledger, TxMeta, TxRecord, TxStatus, TxUpdate};
pub use manager::{Outcome, WalletStateManager};
pub use signal::Signal;
pub use state::{StateContext, WalletState};
pub use storage::{FileStore, MemoryStore, Store};
pub use tx::{FeeEstimator, FixedFeeEstimator, TargetKind, TxStage};
pub use wallet::{Balance, Wallet};

/// Result type for wallet core operations
pub type Result<T> = std::result::Result<T, WalletError>;
