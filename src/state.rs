//! Wallet state snapshot
//!
//! [`WalletState`] composes the ledger, the coin tracker and the history
//! builder into one unit that is mutated as a whole. The state manager hands
//! each queued operation its own copy; the copy becomes current only when the
//! operation commits, so the three indexes can never be observed out of sync.

use bitcoin::{Network, OutPoint, Script, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::asset::AssetRegistry;
use crate::coins::{CoinTracker, FreezeOptions};
use crate::color::ColorValue;
use crate::error::WalletError;
use crate::history::HistoryBuilder;
use crate::ledger::{wallet_clock, Ledger, TxMeta, TxStatus, TxUpdate};
use crate::signal::{Signal, SignalBuffer};
use crate::Result;

/// Wallet facts the indexes need but do not own
#[derive(Clone, Debug)]
pub struct StateContext {
    pub network: Network,
    /// Every address the wallet has derived
    pub addresses: HashSet<String>,
    pub registry: AssetRegistry,
}

impl StateContext {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            addresses: HashSet::new(),
            registry: AssetRegistry::new(),
        }
    }

    /// Wallet addresses paid by `script`
    pub fn addresses_of_script(&self, script: &Script) -> Vec<String> {
        bitcoin::Address::from_script(script, self.network)
            .ok()
            .map(|a| a.to_string())
            .filter(|a| self.addresses.contains(a))
            .into_iter()
            .collect()
    }

    pub fn is_wallet_script(&self, script: &Script) -> bool {
        !self.addresses_of_script(script).is_empty()
    }
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new(Network::Signet)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalletState {
    ledger: Ledger,
    coins: CoinTracker,
    history: HistoryBuilder,
    chain_height: u32,
    #[serde(skip)]
    context: StateContext,
    #[serde(skip)]
    signals: SignalBuffer,
}

impl WalletState {
    pub fn new(context: StateContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn coins(&self) -> &CoinTracker {
        &self.coins
    }

    pub fn history(&self) -> &HistoryBuilder {
        &self.history
    }

    pub fn chain_height(&self) -> u32 {
        self.chain_height
    }

    pub fn context(&self) -> &StateContext {
        &self.context
    }

    pub fn set_context(&mut self, context: StateContext) {
        self.context = context;
    }

    pub fn signals(&self) -> &SignalBuffer {
        &self.signals
    }

    pub(crate) fn take_signals(&mut self) -> Vec<Signal> {
        self.signals.drain()
    }

    pub fn signal(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    /// Wallet addresses `tx` pays to or spends from
    fn touched_addresses(&self, tx: &Transaction) -> BTreeSet<String> {
        let mut addresses: BTreeSet<String> = tx
            .output
            .iter()
            .flat_map(|out| self.context.addresses_of_script(&out.script_pubkey))
            .collect();
        for input in &tx.input {
            if let Some(coin) = self.coins.get_coin(&input.previous_output) {
                addresses.extend(coin.addresses.iter().cloned());
            }
        }
        addresses
    }

    /// Track a transaction observed on the backend
    pub fn add_tx(&mut self, tx: &Transaction, meta: TxMeta, colors: &[ColorValue]) -> Result<()> {
        let addresses = self.touched_addresses(tx);
        self.ledger.add_tx(tx, meta, addresses, &mut self.signals)?;
        if meta.status.is_valid() {
            self.coins
                .add_tx(tx, colors, &self.context, &mut self.signals)?;
            self.history.add_tx(
                tx,
                colors,
                &self.ledger,
                &self.coins,
                &self.context,
                &mut self.signals,
            )?;
        }
        Ok(())
    }

    /// Apply a status/height change, reverting or re-adding derived indexes
    /// when validity flips
    ///
    /// `colors` is only consulted when an invalid transaction becomes valid.
    pub fn update_tx(
        &mut self,
        txid: &Txid,
        update: TxUpdate,
        colors: Option<&[ColorValue]>,
    ) -> Result<bool> {
        let tx = self
            .ledger
            .get_tx(txid)
            .cloned()
            .ok_or_else(|| WalletError::tx_not_found(txid))?;
        let was_valid = self.ledger.get_tx_status(txid).is_valid();

        if !self.ledger.update_tx(txid, update, &mut self.signals)? {
            return Ok(false);
        }
        let is_valid = self.ledger.get_tx_status(txid).is_valid();

        match (was_valid, is_valid) {
            (true, false) => {
                log::info!("Transaction {} became invalid, reverting", txid);
                self.coins
                    .revert_tx(&tx, &self.context, &mut self.signals)?;
                self.history.revert_tx(&tx, &mut self.signals);
            }
            (false, true) => {
                let colors = colors.ok_or_else(|| {
                    WalletError::Internal(format!("color values required to re-add {}", txid))
                })?;
                log::info!("Transaction {} became valid again", txid);
                self.coins
                    .add_tx(&tx, colors, &self.context, &mut self.signals)?;
                self.history.add_tx(
                    &tx,
                    colors,
                    &self.ledger,
                    &self.coins,
                    &self.context,
                    &mut self.signals,
                )?;
            }
            (true, true) => {
                self.coins.update_tx(&tx);
                self.history
                    .update_tx(&tx, &self.ledger, &mut self.signals)?;
            }
            (false, false) => {}
        }
        Ok(true)
    }

    /// Record a wallet-originated transaction as dispatched
    pub fn send_tx(&mut self, tx: &Transaction, colors: &[ColorValue]) -> Result<()> {
        let addresses = self.touched_addresses(tx);
        self.ledger.send_tx(tx, addresses, &mut self.signals)?;
        self.coins
            .add_tx(tx, colors, &self.context, &mut self.signals)?;
        self.history.add_tx(
            tx,
            colors,
            &self.ledger,
            &self.coins,
            &self.context,
            &mut self.signals,
        )
    }

    /// Move a dispatched transaction to `Pending` after backend acceptance
    pub fn mark_pending(&mut self, txid: &Txid) -> Result<bool> {
        self.update_tx(txid, TxUpdate::status(TxStatus::Pending), None)
    }

    pub fn freeze_coins(&mut self, outpoints: &[OutPoint], opts: FreezeOptions) -> Result<()> {
        self.coins.freeze_coins(
            outpoints,
            opts,
            self.chain_height,
            wallet_clock(),
            &mut self.signals,
        )
    }

    pub fn unfreeze_coins(&mut self, outpoints: &[OutPoint]) {
        self.coins.unfreeze_coins(outpoints, &mut self.signals);
    }

    /// Returns `true` when the height moved
    pub fn set_chain_height(&mut self, height: u32) -> bool {
        if height == self.chain_height {
            return false;
        }
        self.chain_height = height;
        self.signals.push(Signal::NewHeight(height));
        true
    }
}
