//! Common test utilities for wallet core integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-memory chain standing in for the Esplora backend
//! - A color oracle driven by an explicit outpoint -> color table
//! - Transaction and state fixtures
//! - Test environment setup with a temporary data directory

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use cc_wallet_core::backend::{Backend, HistoryItem};
use cc_wallet_core::color::{ColorDefinition, ColorOracle, ColorValue, TxSource};
use cc_wallet_core::config::{StateConfig, WalletConfig};
use cc_wallet_core::state::{StateContext, WalletState};
use cc_wallet_core::storage::MemoryStore;
use cc_wallet_core::{HdAddressManager, Wallet, WalletError};

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const BLOCK_TIME_BASE: u64 = 1_700_000_000;

pub fn init_logging() {
    dotenv::dotenv().ok();
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn seed() -> Vec<u8> {
    HdAddressManager::seed_from_mnemonic(MNEMONIC).expect("test mnemonic is valid")
}

static NONCE: AtomicU32 = AtomicU32::new(1);

/// Outpoint nothing in the wallet knows about, unique per call
pub fn foreign_outpoint() -> OutPoint {
    let n = NONCE.fetch_add(1, Ordering::SeqCst);
    let mut bytes = [0xee; 32];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    OutPoint {
        txid: Txid::from_byte_array(bytes),
        vout: 0,
    }
}

/// Script of a P2WPKH address outside the wallet
pub fn external_script() -> ScriptBuf {
    let hash = bitcoin::WPubkeyHash::from_byte_array([0x42; 20]);
    ScriptBuf::new_p2wpkh(&hash)
}

pub fn tx(inputs: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|prev| TxIn {
                previous_output: *prev,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script.clone(),
            })
            .collect(),
    }
}

/// Transaction funding `script` from outside the wallet
pub fn funding_tx(script: &ScriptBuf, value: u64) -> Transaction {
    tx(&[foreign_outpoint()], &[(script.clone(), value)])
}

pub fn uncolored(tx: &Transaction) -> Vec<ColorValue> {
    tx.output
        .iter()
        .map(|o| ColorDefinition::uncolored().value(o.value.to_sat()))
        .collect()
}

/// Wallet address derived from the test seed
pub fn wallet_address(index: u32) -> Address {
    let manager = HdAddressManager::new(Network::Regtest);
    let color = ColorDefinition::uncolored();
    let mut address = None;
    for _ in 0..=index {
        address = Some(
            cc_wallet_core::AddressManager::get_new_address(&manager, &color, &seed())
                .expect("derivation succeeds"),
        );
    }
    address.expect("at least one address derived")
}

/// Empty state whose wallet owns `addresses`
pub fn state_with(addresses: &[&Address]) -> WalletState {
    let mut ctx = StateContext::new(Network::Regtest);
    ctx.addresses = addresses.iter().map(|a| a.to_string()).collect();
    WalletState::new(ctx)
}

#[derive(Default)]
struct MockChain {
    txs: HashMap<Txid, Transaction>,
    heights: HashMap<Txid, u32>,
    order: Vec<Txid>,
    tip: u32,
    failing_sends: u32,
    send_attempts: u32,
}

/// In-memory chain; histories are derived from the published transactions
#[derive(Default)]
pub struct MockBackend {
    chain: Mutex<MockChain>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, tx: &Transaction, height: u32) {
        let mut chain = self.chain.lock().unwrap();
        let txid = tx.compute_txid();
        if chain.txs.insert(txid, tx.clone()).is_none() {
            chain.order.push(txid);
        }
        chain.heights.insert(txid, height);
        chain.tip = chain.tip.max(height);
    }

    pub fn confirm(&self, txid: &Txid, height: u32) {
        let mut chain = self.chain.lock().unwrap();
        chain.heights.insert(*txid, height);
        chain.tip = chain.tip.max(height);
    }

    /// Forget a transaction, as if evicted or double-spent
    pub fn drop_tx(&self, txid: &Txid) {
        let mut chain = self.chain.lock().unwrap();
        chain.txs.remove(txid);
        chain.heights.remove(txid);
        chain.order.retain(|t| t != txid);
    }

    pub fn set_tip(&self, tip: u32) {
        self.chain.lock().unwrap().tip = tip;
    }

    /// Reject the next `n` broadcasts
    pub fn fail_next_sends(&self, n: u32) {
        self.chain.lock().unwrap().failing_sends = n;
    }

    pub fn send_attempts(&self) -> u32 {
        self.chain.lock().unwrap().send_attempts
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.chain.lock().unwrap().txs.contains_key(txid)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_tx(&self, txid: &Txid) -> cc_wallet_core::Result<Transaction> {
        self.chain
            .lock()
            .unwrap()
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", txid)))
    }

    async fn get_history(&self, address: &str) -> cc_wallet_core::Result<Vec<HistoryItem>> {
        let chain = self.chain.lock().unwrap();
        let script = address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .assume_checked()
            .script_pubkey();

        let pays = |tx: &Transaction| tx.output.iter().any(|o| o.script_pubkey == script);
        let spends = |tx: &Transaction| {
            tx.input.iter().any(|i| {
                chain
                    .txs
                    .get(&i.previous_output.txid)
                    .and_then(|prev| prev.output.get(i.previous_output.vout as usize))
                    .map_or(false, |o| o.script_pubkey == script)
            })
        };

        Ok(chain
            .order
            .iter()
            .filter_map(|txid| {
                let tx = chain.txs.get(txid)?;
                (pays(tx) || spends(tx)).then(|| HistoryItem {
                    txid: *txid,
                    height: chain.heights.get(txid).copied().unwrap_or(0),
                })
            })
            .collect())
    }

    async fn get_block_time(&self, height: u32) -> cc_wallet_core::Result<u64> {
        Ok(BLOCK_TIME_BASE + height as u64 * 600)
    }

    async fn get_tip_height(&self) -> cc_wallet_core::Result<u32> {
        Ok(self.chain.lock().unwrap().tip)
    }

    async fn send_tx(&self, tx: &Transaction) -> cc_wallet_core::Result<Txid> {
        {
            let mut chain = self.chain.lock().unwrap();
            chain.send_attempts += 1;
            if chain.failing_sends > 0 {
                chain.failing_sends -= 1;
                return Err(WalletError::Backend("mempool rejected".to_string()));
            }
        }
        self.publish(tx, 0);
        Ok(tx.compute_txid())
    }

    async fn subscribe_address(&self, _address: &str) -> cc_wallet_core::Result<()> {
        Ok(())
    }
}

/// Oracle coloring explicitly listed outputs; every other output is plain
#[derive(Default)]
pub struct TableOracle {
    table: Mutex<HashMap<OutPoint, ColorValue>>,
}

impl TableOracle {
    pub fn color(&self, outpoint: OutPoint, value: ColorValue) {
        self.table.lock().unwrap().insert(outpoint, value);
    }
}

#[async_trait]
impl ColorOracle for TableOracle {
    async fn get_color_values(
        &self,
        tx: &Transaction,
        color_defs: &[ColorDefinition],
        _source: &dyn TxSource,
    ) -> cc_wallet_core::Result<Vec<Option<ColorValue>>> {
        let txid = tx.compute_txid();
        let known: BTreeSet<u32> = color_defs.iter().map(|d| d.id()).collect();
        let table = self.table.lock().unwrap();
        Ok((0..tx.output.len() as u32)
            .map(|vout| {
                table
                    .get(&OutPoint { txid, vout })
                    .copied()
                    .filter(|v| known.contains(&v.color_id))
            })
            .collect())
    }
}

/// Source that only knows the transactions it was given
pub struct MapSource(pub HashMap<Txid, Transaction>);

#[async_trait]
impl TxSource for MapSource {
    async fn get_tx(&self, txid: &Txid) -> cc_wallet_core::Result<Transaction> {
        self.0
            .get(txid)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(txid.to_string()))
    }
}

pub fn test_config(dir: &TempDir) -> WalletConfig {
    WalletConfig {
        network: Network::Regtest,
        esplora_url: "http://127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
        spend_unconfirmed: false,
        fee_rate_sat_vb: 1,
        state: StateConfig {
            store_prefix: "test".to_string(),
            save_debounce: Duration::from_millis(10),
            send_retry_base: Duration::from_millis(5),
            max_send_attempts: 5,
        },
    }
}

/// Wallet over the mock chain with an in-memory store
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub oracle: Arc<TableOracle>,
    pub store: Arc<MemoryStore>,
    pub wallet: Wallet,
}

impl TestEnvironment {
    pub async fn new() -> anyhow::Result<Self> {
        init_logging();
        let temp_dir = TempDir::new()?;
        let backend = Arc::new(MockBackend::new());
        let oracle = Arc::new(TableOracle::default());
        let store = Arc::new(MemoryStore::new());
        let wallet = Wallet::with_parts(
            test_config(&temp_dir),
            store.clone(),
            backend.clone(),
            oracle.clone(),
        )
        .await?;

        Ok(Self {
            temp_dir,
            backend,
            oracle,
            store,
            wallet,
        })
    }

    /// Open a second wallet over the same store and chain
    pub async fn reopen(&self) -> anyhow::Result<Wallet> {
        Ok(Wallet::with_parts(
            test_config(&self.temp_dir),
            self.store.clone(),
            self.backend.clone(),
            self.oracle.clone(),
        )
        .await?)
    }
}

/// Poll `check` until it holds or the timeout passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
