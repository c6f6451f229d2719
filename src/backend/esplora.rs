use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::{Transaction, Txid};
use std::str::FromStr;

use super::types::{AddressTxResponse, BlockResponse};
use super::{Backend, HistoryItem};
use crate::error::WalletError;
use crate::Result;

/// Esplora serves at most this many confirmed transactions per page
const CHAIN_PAGE_SIZE: usize = 25;

/// [`Backend`] over the Esplora REST API
#[derive(Clone)]
pub struct EsploraBackend {
    client: reqwest::Client,
    base_url: String,
}

impl EsploraBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WalletError::Backend(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WalletError::Backend(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    fn history_item(entry: &AddressTxResponse) -> Result<HistoryItem> {
        let txid = Txid::from_str(&entry.txid)
            .map_err(|e| WalletError::Backend(format!("bad txid {}: {}", entry.txid, e)))?;
        let height = if entry.status.confirmed {
            entry.status.block_height.unwrap_or(0)
        } else {
            0
        };
        Ok(HistoryItem { txid, height })
    }
}

#[async_trait]
impl Backend for EsploraBackend {
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction> {
        let hex = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        Ok(deserialize_hex(hex.trim())?)
    }

    /// First page holds mempool plus newest confirmed; older confirmed
    /// transactions are paged by last seen txid
    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>> {
        let mut page: Vec<AddressTxResponse> =
            self.get_json(&format!("/address/{}/txs", address)).await?;
        let mut items = Vec::new();

        loop {
            let confirmed = page.iter().filter(|e| e.status.confirmed).count();
            for entry in &page {
                items.push(Self::history_item(entry)?);
            }
            let Some(last) = page.iter().rev().find(|e| e.status.confirmed) else {
                break;
            };
            if confirmed < CHAIN_PAGE_SIZE {
                break;
            }
            page = self
                .get_json(&format!("/address/{}/txs/chain/{}", address, last.txid))
                .await?;
            if page.is_empty() {
                break;
            }
        }

        log::debug!("History of {}: {} transactions", address, items.len());
        Ok(items)
    }

    async fn get_block_time(&self, height: u32) -> Result<u64> {
        let hash = self.get_text(&format!("/block-height/{}", height)).await?;
        let block: BlockResponse = self.get_json(&format!("/block/{}", hash.trim())).await?;
        Ok(block.timestamp)
    }

    async fn get_tip_height(&self) -> Result<u32> {
        self.get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| WalletError::Backend(e.to_string()))
    }

    async fn send_tx(&self, tx: &Transaction) -> Result<Txid> {
        let tx_hex = serialize_hex(tx);
        log::debug!("Broadcasting transaction to: {}/tx", self.base_url);

        let response = self
            .client
            .post(format!("{}/tx", self.base_url))
            .body(tx_hex)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(WalletError::Backend(format!(
                "Broadcast failed: {}",
                error_text
            )));
        }

        let txid = response.text().await?;
        Txid::from_str(txid.trim()).map_err(|e| WalletError::Backend(e.to_string()))
    }

    async fn subscribe_address(&self, address: &str) -> Result<()> {
        log::debug!("Esplora has no push channel; {} is polled on sync", address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TxStatusResponse;

    #[test]
    fn test_mempool_entries_have_zero_height() {
        let entry = AddressTxResponse {
            txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b".to_string(),
            status: TxStatusResponse {
                confirmed: false,
                block_height: Some(12),
                block_hash: None,
                block_time: None,
            },
        };
        assert_eq!(EsploraBackend::history_item(&entry).unwrap().height, 0);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = EsploraBackend::new("http://localhost:3002/");
        assert_eq!(backend.base_url(), "http://localhost:3002");
    }
}
