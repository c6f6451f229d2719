//! Blockchain backend
//!
//! The state manager only talks to the chain through [`Backend`]. History
//! items report height 0 for mempool transactions; a history is always the
//! complete set of transactions touching the address, so a tracked
//! transaction missing from it is no longer known to the network.

mod esplora;
mod types;

pub use esplora::EsploraBackend;
pub use types::{AddressTxResponse, BlockResponse, TxStatusResponse};

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub txid: Txid,
    /// 0 while in the mempool
    pub height: u32,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction>;

    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>>;

    /// Timestamp of the block at `height`
    async fn get_block_time(&self, height: u32) -> Result<u64>;

    async fn get_tip_height(&self) -> Result<u32>;

    async fn send_tx(&self, tx: &Transaction) -> Result<Txid>;

    /// Ask to be notified about `address`; polling backends may ignore it
    async fn subscribe_address(&self, address: &str) -> Result<()>;
}
