//! Coin tracker
//!
//! Derived from the ledger: a [`CoinRecord`] exists for every output of a
//! tracked, valid transaction that pays at least one wallet address. The
//! spend index records which tracked transactions consume each output, so
//! conflicting spends can be reverted one at a time.
//! Status is never stored here; validity and availability are read from the
//! ledger on demand.
//!
//! - `add_tx` / `revert_tx` are exact inverses for spend entries and records
//! - freeze records are independent of the ledger and survive reverts

mod query;

pub use query::{CoinList, CoinQuery};

use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::color::ColorValue;
use crate::error::WalletError;
use crate::ledger::Ledger;
use crate::signal::{Signal, SignalBuffer};
use crate::state::StateContext;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoinRecord {
    pub txid: Txid,
    pub out_index: u32,
    pub value: u64,
    pub script: ScriptBuf,
    pub addresses: Vec<String>,
    pub color_value: ColorValue,
    /// Insertion order, used to make queries deterministic
    pub seq: u64,
}

impl CoinRecord {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.out_index,
        }
    }
}

/// Unlock condition of a frozen coin
///
/// With neither field set the coin stays frozen until explicitly unfrozen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub height: Option<u32>,
    pub timestamp: Option<u64>,
}

impl FreezeRecord {
    pub fn is_locked(&self, chain_height: u32, now: u64) -> bool {
        match (self.height, self.timestamp) {
            (None, None) => true,
            (height, timestamp) => {
                height.map_or(false, |h| chain_height < h)
                    || timestamp.map_or(false, |t| now < t)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FreezeOptions {
    pub height: Option<u32>,
    pub timestamp: Option<u64>,
    /// Interpret `height`/`timestamp` as offsets from the current chain tip and clock
    pub from_now: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoinTracker {
    coins: BTreeMap<Txid, BTreeMap<u32, CoinRecord>>,
    spends: BTreeMap<Txid, BTreeMap<u32, BTreeSet<Txid>>>,
    freezes: BTreeMap<Txid, BTreeMap<u32, FreezeRecord>>,
    next_seq: u64,
}

impl CoinTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the spends and wallet outputs of `tx`
    ///
    /// `color_values` holds one resolved value per output.
    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        color_values: &[ColorValue],
        ctx: &StateContext,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        if color_values.len() != tx.output.len() {
            return Err(WalletError::Internal(format!(
                "{} color values for {} outputs of {}",
                color_values.len(),
                tx.output.len(),
                txid
            )));
        }

        for input in &tx.input {
            let prev = input.previous_output;
            self.spends
                .entry(prev.txid)
                .or_default()
                .entry(prev.vout)
                .or_default()
                .insert(txid);
        }

        let mut touched_addresses = Vec::new();
        let mut touched_colors = self.input_colors(tx);
        let mut outputs = BTreeMap::new();
        for (index, out) in tx.output.iter().enumerate() {
            let addresses = ctx.addresses_of_script(&out.script_pubkey);
            if addresses.is_empty() {
                continue;
            }
            let color_value = color_values[index];
            touched_colors.push(color_value);
            touched_addresses.extend(addresses.iter().cloned());
            outputs.insert(
                index as u32,
                CoinRecord {
                    txid,
                    out_index: index as u32,
                    value: out.value.to_sat(),
                    script: out.script_pubkey.clone(),
                    addresses,
                    color_value,
                    seq: self.next_seq,
                },
            );
            self.next_seq += 1;
        }

        log::debug!("Coin tracker add {} ({} wallet outputs)", txid, outputs.len());
        if !outputs.is_empty() {
            self.coins.insert(txid, outputs);
        }

        for address in touched_addresses {
            signals.push(Signal::TouchAddress(address));
        }
        Self::signal_colors(&touched_colors, ctx, signals)
    }

    /// Undo everything `add_tx` indexed for `tx`
    pub fn revert_tx(
        &mut self,
        tx: &Transaction,
        ctx: &StateContext,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        let mut touched_colors = self.input_colors(tx);
        let mut touched_addresses: Vec<String> = self
            .input_coins(tx)
            .flat_map(|c| c.addresses.iter().cloned())
            .collect();

        for input in &tx.input {
            let prev = input.previous_output;
            if let Some(spent) = self.spends.get_mut(&prev.txid) {
                if let Some(spenders) = spent.get_mut(&prev.vout) {
                    spenders.remove(&txid);
                    if spenders.is_empty() {
                        spent.remove(&prev.vout);
                    }
                }
                if spent.is_empty() {
                    self.spends.remove(&prev.txid);
                }
            }
        }

        if let Some(outputs) = self.coins.remove(&txid) {
            for record in outputs.into_values() {
                touched_colors.push(record.color_value);
                touched_addresses.extend(record.addresses);
            }
        }

        log::debug!("Coin tracker revert {}", txid);
        signals.push(Signal::RevertTx(txid));
        for address in touched_addresses {
            signals.push(Signal::TouchAddress(address));
        }
        Self::signal_colors(&touched_colors, ctx, signals)
    }

    /// Status lives in the ledger; nothing to index
    pub fn update_tx(&mut self, _tx: &Transaction) {}

    fn input_coins<'a>(&'a self, tx: &'a Transaction) -> impl Iterator<Item = &'a CoinRecord> + 'a {
        tx.input
            .iter()
            .filter_map(move |input| self.get_coin(&input.previous_output))
    }

    fn input_colors(&self, tx: &Transaction) -> Vec<ColorValue> {
        self.input_coins(tx).map(|c| c.color_value).collect()
    }

    fn signal_colors(
        colors: &[ColorValue],
        ctx: &StateContext,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        for color_value in colors {
            match ctx.registry.asset_for_color(color_value.color_id)? {
                Some(asset) => signals.push(Signal::TouchAsset(asset.id.clone())),
                None => {
                    if let Some(def) = ctx.registry.colors().get(color_value.color_id) {
                        signals.push(Signal::NewColor(def.desc().to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<&CoinRecord> {
        self.coins.get(&outpoint.txid)?.get(&outpoint.vout)
    }

    /// Coin records in insertion order, optionally limited to `addresses`
    pub fn get_coins(&self, addresses: Option<&[String]>) -> Vec<CoinRecord> {
        let mut coins: Vec<CoinRecord> = self
            .coins
            .values()
            .flat_map(|outputs| outputs.values())
            .filter(|c| match addresses {
                None => true,
                Some(addrs) => c.addresses.iter().any(|a| addrs.contains(a)),
            })
            .cloned()
            .collect();
        coins.sort_by_key(|c| c.seq);
        coins
    }

    pub fn is_coin_spent(&self, outpoint: &OutPoint) -> bool {
        self.spends
            .get(&outpoint.txid)
            .map_or(false, |spent| spent.contains_key(&outpoint.vout))
    }

    /// Tracked transactions spending `outpoint`
    pub fn get_spenders(&self, outpoint: &OutPoint) -> Vec<Txid> {
        self.spends
            .get(&outpoint.txid)
            .and_then(|spent| spent.get(&outpoint.vout))
            .map(|spenders| spenders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_coin_valid(&self, outpoint: &OutPoint, ledger: &Ledger) -> bool {
        ledger.get_tx_status(&outpoint.txid).is_valid()
    }

    pub fn is_coin_available(&self, outpoint: &OutPoint, ledger: &Ledger) -> bool {
        ledger.get_tx_status(&outpoint.txid).is_available()
    }

    pub fn is_coin_frozen(&self, outpoint: &OutPoint, chain_height: u32, now: u64) -> bool {
        self.get_freeze(outpoint)
            .map_or(false, |f| f.is_locked(chain_height, now))
    }

    pub fn get_freeze(&self, outpoint: &OutPoint) -> Option<&FreezeRecord> {
        self.freezes.get(&outpoint.txid)?.get(&outpoint.vout)
    }

    pub fn freeze_coins(
        &mut self,
        outpoints: &[OutPoint],
        opts: FreezeOptions,
        chain_height: u32,
        now: u64,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let record = if opts.from_now {
            FreezeRecord {
                height: opts.height.map(|h| chain_height.saturating_add(h)),
                timestamp: opts.timestamp.map(|t| now.saturating_add(t)),
            }
        } else {
            FreezeRecord {
                height: opts.height,
                timestamp: opts.timestamp,
            }
        };

        for outpoint in outpoints {
            let coin = self
                .get_coin(outpoint)
                .ok_or(WalletError::CoinNotFound(*outpoint))?;
            for address in &coin.addresses {
                signals.push(Signal::TouchAddress(address.clone()));
            }
            self.freezes
                .entry(outpoint.txid)
                .or_default()
                .insert(outpoint.vout, record);
        }
        log::info!("Froze {} coins ({:?})", outpoints.len(), record);
        Ok(())
    }

    pub fn unfreeze_coins(&mut self, outpoints: &[OutPoint], signals: &mut SignalBuffer) {
        for outpoint in outpoints {
            if let Some(frozen) = self.freezes.get_mut(&outpoint.txid) {
                if frozen.remove(&outpoint.vout).is_some() {
                    if let Some(coin) = self.coins.get(&outpoint.txid).and_then(|o| o.get(&outpoint.vout)) {
                        for address in &coin.addresses {
                            signals.push(Signal::TouchAddress(address.clone()));
                        }
                    }
                }
                if frozen.is_empty() {
                    self.freezes.remove(&outpoint.txid);
                }
            }
        }
    }

    /// Spend index view: prev txid -> spent output index -> spenders
    pub fn spends(&self) -> &BTreeMap<Txid, BTreeMap<u32, BTreeSet<Txid>>> {
        &self.spends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freeze_record_conditions() {
        let forever = FreezeRecord::default();
        assert!(forever.is_locked(u32::MAX, u64::MAX));

        let by_height = FreezeRecord {
            height: Some(100),
            timestamp: None,
        };
        assert!(by_height.is_locked(99, 0));
        assert!(!by_height.is_locked(100, 0));

        let both = FreezeRecord {
            height: Some(100),
            timestamp: Some(5_000),
        };
        assert!(both.is_locked(150, 4_999));
        assert!(!both.is_locked(150, 5_000));
    }
}
