//! Wallet activity history
//!
//! One [`HistoryEntry`] per valid tracked transaction, regenerated whenever
//! the transaction is added, changes status or is reverted. Entries are kept
//! in causal order: first by block height (timestamp as tie-break, mempool
//! transactions after all confirmed ones, by timestamp), then a depth-first
//! pass moves every transaction after the wallet transactions it spends from.

use bitcoin::{ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::coins::CoinTracker;
use crate::color::{ColorId, ColorValue};
use crate::error::WalletError;
use crate::ledger::Ledger;
use crate::signal::{Signal, SignalBuffer};
use crate::state::StateContext;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    Send,
    Receive,
    PaymentToSelf,
    Issue,
}

/// Net change of one asset for the wallet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDelta {
    pub asset_id: String,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTarget {
    pub asset_id: String,
    pub value: u64,
    pub script: ScriptBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub values: Vec<AssetDelta>,
    /// Own outputs for a receive, foreign outputs otherwise
    pub targets: Vec<HistoryTarget>,
    pub entry_type: EntryType,
}

impl HistoryEntry {
    pub fn touches_asset(&self, asset_id: &str) -> bool {
        self.values.iter().any(|v| v.asset_id == asset_id)
            || self.targets.iter().any(|t| t.asset_id == asset_id)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryBuilder {
    entries: Vec<HistoryEntry>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        color_values: &[ColorValue],
        ledger: &Ledger,
        coins: &CoinTracker,
        ctx: &StateContext,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let entry = Self::build_entry(tx, color_values, coins, ctx)?;
        log::debug!("History add {} as {:?}", entry.txid, entry.entry_type);

        self.entries.retain(|e| e.txid != entry.txid);
        self.entries.push(entry);
        self.sort(ledger)?;
        signals.push(Signal::HistoryUpdate);
        Ok(())
    }

    pub fn update_tx(
        &mut self,
        _tx: &Transaction,
        ledger: &Ledger,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        self.sort(ledger)?;
        signals.push(Signal::HistoryUpdate);
        Ok(())
    }

    pub fn revert_tx(&mut self, tx: &Transaction, signals: &mut SignalBuffer) {
        let txid = tx.compute_txid();
        let before = self.entries.len();
        self.entries.retain(|e| e.txid != txid);
        if self.entries.len() != before {
            log::debug!("History revert {}", txid);
        }
        signals.push(Signal::HistoryUpdate);
    }

    /// Ordered entries, optionally only those touching `asset_id`
    pub fn get_entries(&self, asset_id: Option<&str>) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|e| asset_id.map_or(true, |id| e.touches_asset(id)))
            .cloned()
            .collect()
    }

    pub fn get_entry(&self, txid: &Txid) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.txid == *txid)
    }

    fn build_entry(
        tx: &Transaction,
        color_values: &[ColorValue],
        coins: &CoinTracker,
        ctx: &StateContext,
    ) -> Result<HistoryEntry> {
        let txid = tx.compute_txid();
        let mut sums: BTreeMap<ColorId, i64> = BTreeMap::new();

        let mut my_inputs = 0;
        for input in &tx.input {
            if let Some(coin) = coins.get_coin(&input.previous_output) {
                my_inputs += 1;
                *sums.entry(coin.color_value.color_id).or_default() -=
                    coin.color_value.value as i64;
            }
        }

        let mut my_outputs = 0;
        let mut my_targets = Vec::new();
        let mut other_targets = Vec::new();
        let mut issues = false;
        for (out, color_value) in tx.output.iter().zip(color_values) {
            if let Some(def) = ctx.registry.colors().get(color_value.color_id) {
                issues |= def.genesis().map_or(false, |g| g.txid == txid);
            }
            if ctx.is_wallet_script(&out.script_pubkey) {
                my_outputs += 1;
                *sums.entry(color_value.color_id).or_default() += color_value.value as i64;
                my_targets.push((*color_value, out.script_pubkey.clone()));
            } else {
                other_targets.push((*color_value, out.script_pubkey.clone()));
            }
        }

        let mut values: Vec<AssetDelta> = Vec::new();
        for (color_id, value) in sums {
            let Some(asset) = ctx.registry.asset_for_color(color_id)? else {
                continue;
            };
            match values.iter_mut().find(|v| v.asset_id == asset.id) {
                Some(delta) => delta.value += value,
                None => values.push(AssetDelta {
                    asset_id: asset.id.clone(),
                    value,
                }),
            }
        }

        let entry_type = if issues {
            EntryType::Issue
        } else if my_inputs == 0 {
            EntryType::Receive
        } else if my_inputs == tx.input.len() && my_outputs == tx.output.len() {
            EntryType::PaymentToSelf
        } else {
            EntryType::Send
        };

        let shown = if entry_type == EntryType::Receive {
            my_targets
        } else {
            other_targets
        };
        let mut targets = Vec::new();
        for (color_value, script) in shown {
            if let Some(asset) = ctx.registry.asset_for_color(color_value.color_id)? {
                targets.push(HistoryTarget {
                    asset_id: asset.id.clone(),
                    value: color_value.value,
                    script,
                });
            }
        }

        Ok(HistoryEntry {
            txid,
            values,
            targets,
            entry_type,
        })
    }

    /// Height/timestamp sort followed by dependency-aware placement
    fn sort(&mut self, ledger: &Ledger) -> Result<()> {
        let sort_key = |entry: &HistoryEntry| -> f64 {
            match ledger.get_tx_data(&entry.txid) {
                Some(r) if r.height > 0 => r.height as f64 + r.timestamp as f64 / 1e10,
                Some(r) => r.timestamp as f64,
                None => 0.0,
            }
        };
        self.entries
            .sort_by(|a, b| sort_key(a).partial_cmp(&sort_key(b)).unwrap_or(Ordering::Equal));

        let position: HashMap<Txid, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.txid, i))
            .collect();

        let mut visit = Visit {
            ledger,
            position: &position,
            entries: &self.entries,
            placed: vec![false; self.entries.len()],
            in_progress: vec![false; self.entries.len()],
            order: Vec::with_capacity(self.entries.len()),
        };
        for i in 0..self.entries.len() {
            visit.place(i)?;
        }

        let order = visit.order;
        let mut slots: Vec<Option<HistoryEntry>> = self.entries.drain(..).map(Some).collect();
        self.entries = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }
}

/// Depth-first placement state
struct Visit<'a> {
    ledger: &'a Ledger,
    position: &'a HashMap<Txid, usize>,
    entries: &'a [HistoryEntry],
    placed: Vec<bool>,
    in_progress: Vec<bool>,
    order: Vec<usize>,
}

impl Visit<'_> {
    fn place(&mut self, index: usize) -> Result<()> {
        if self.placed[index] {
            return Ok(());
        }
        let txid = self.entries[index].txid;
        if self.in_progress[index] {
            return Err(WalletError::CyclicGraph(txid));
        }
        self.in_progress[index] = true;

        if let Some(tx) = self.ledger.get_tx(&txid) {
            for input in &tx.input {
                if let Some(&dep) = self.position.get(&input.previous_output.txid) {
                    if dep != index {
                        self.place(dep)?;
                    }
                }
            }
        }

        self.in_progress[index] = false;
        self.placed[index] = true;
        self.order.push(index);
        Ok(())
    }
}
