//! Esplora API response types
//!
//! Only the fields the wallet reads are modelled; everything else in the
//! responses is ignored by serde.

use serde::{Deserialize, Serialize};

/// Confirmation status embedded in transaction listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStatusResponse {
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_time: Option<u64>,
}

/// Entry of /address/{address}/txs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressTxResponse {
    pub txid: String,
    pub status: TxStatusResponse,
}

/// Block header summary from /block/{hash}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub id: String,
    pub height: u32,
    pub timestamp: u64,
}
