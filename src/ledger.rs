//! Transaction ledger
//!
//! Stores one [`TxRecord`] per tracked transaction and owns the status state
//! machine:
//!
//! ```text
//! Unknown ──▶ Unconfirmed ──▶ Confirmed
//!                 │               │
//!                 └──▶ Invalid ◀──┘
//!
//! Dispatch ──▶ Pending ──▶ Confirmed | Invalid      (wallet-originated)
//! ```
//!
//! A record in `Dispatch` or `Pending` ignores incoming `Unconfirmed` updates:
//! history sync reporting a mempool tx must not roll back what self-broadcast
//! tracking already knows.

use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::WalletError;
use crate::signal::{Signal, SignalBuffer};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Unknown,
    Unconfirmed,
    Confirmed,
    Invalid,
    Pending,
    Dispatch,
}

impl TxStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Unconfirmed => 1,
            Self::Confirmed => 2,
            Self::Invalid => 3,
            Self::Pending => 4,
            Self::Dispatch => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Unconfirmed),
            2 => Some(Self::Confirmed),
            3 => Some(Self::Invalid),
            4 => Some(Self::Pending),
            5 => Some(Self::Dispatch),
            _ => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(
            self,
            Self::Unconfirmed | Self::Confirmed | Self::Pending | Self::Dispatch
        )
    }

    /// Spendable without opting into unconfirmed coins
    pub fn is_available(self) -> bool {
        matches!(self, Self::Confirmed | Self::Pending | Self::Dispatch)
    }

    /// Wallet-originated and still tracked by broadcast logic
    pub fn is_self_tracked(self) -> bool {
        matches!(self, Self::Pending | Self::Dispatch)
    }
}

impl Serialize for TxStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for TxStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown tx status {}", code)))
    }
}

/// Wall-clock seconds used for transactions not yet in a block
pub fn wallet_clock() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Serde adapter persisting transactions as consensus-encoded hex
mod tx_hex {
    use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
    use bitcoin::Transaction;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tx: &Transaction, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&serialize_hex(tx))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Transaction, D::Error> {
        let hex = String::deserialize(d)?;
        deserialize_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: Txid,
    #[serde(with = "tx_hex")]
    pub tx: Transaction,
    pub status: TxStatus,
    /// 0 while the transaction is not in a block
    pub height: u32,
    pub timestamp: u64,
    pub is_block_timestamp: bool,
    pub addresses: BTreeSet<String>,
}

/// Initial status and position of a transaction
#[derive(Clone, Copy, Debug)]
pub struct TxMeta {
    pub status: TxStatus,
    pub height: u32,
    /// Block time resolved by the caller; ignored when `height` is 0
    pub timestamp: Option<u64>,
}

impl TxMeta {
    pub fn unconfirmed() -> Self {
        Self {
            status: TxStatus::Unconfirmed,
            height: 0,
            timestamp: None,
        }
    }

    pub fn confirmed(height: u32, block_time: u64) -> Self {
        Self {
            status: TxStatus::Confirmed,
            height,
            timestamp: Some(block_time),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TxUpdate {
    pub status: Option<TxStatus>,
    pub height: Option<u32>,
    /// Block time matching `height`
    pub timestamp: Option<u64>,
}

impl TxUpdate {
    pub fn status(status: TxStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    records: BTreeMap<Txid, TxRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        meta: TxMeta,
        addresses: BTreeSet<String>,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        if self.records.contains_key(&txid) {
            return Err(WalletError::AlreadyExists(txid));
        }

        let (timestamp, is_block_timestamp) = match (meta.height, meta.timestamp) {
            (0, _) | (_, None) => (wallet_clock(), false),
            (_, Some(block_time)) => (block_time, true),
        };

        log::debug!(
            "Ledger add {} status={:?} height={}",
            txid,
            meta.status,
            meta.height
        );
        self.records.insert(
            txid,
            TxRecord {
                txid,
                tx: tx.clone(),
                status: meta.status,
                height: meta.height,
                timestamp,
                is_block_timestamp,
                addresses,
            },
        );
        signals.push(Signal::AddTx(txid));
        Ok(())
    }

    /// Apply a status/height change
    ///
    /// Returns `false` without signaling when the record is left untouched.
    pub fn update_tx(
        &mut self,
        txid: &Txid,
        update: TxUpdate,
        signals: &mut SignalBuffer,
    ) -> Result<bool> {
        let record = self
            .records
            .get_mut(txid)
            .ok_or_else(|| WalletError::tx_not_found(txid))?;

        let mut status = update.status.unwrap_or(record.status);
        if record.status.is_self_tracked() && status == TxStatus::Unconfirmed {
            log::debug!(
                "Ignoring unconfirmed update for {} (status {:?})",
                txid,
                record.status
            );
            status = record.status;
        }
        let height = update.height.unwrap_or(record.height);

        if status == record.status && height == record.height {
            return Ok(false);
        }

        record.status = status;
        if height != record.height {
            record.height = height;
            match (height, update.timestamp) {
                (0, _) => record.is_block_timestamp = false,
                (_, Some(block_time)) => {
                    record.timestamp = block_time;
                    record.is_block_timestamp = true;
                }
                _ => {}
            }
        }

        log::debug!("Ledger update {} status={:?} height={}", txid, status, height);
        signals.push(Signal::UpdateTx(*txid));
        Ok(true)
    }

    /// Record a wallet-originated transaction about to be broadcast
    pub fn send_tx(
        &mut self,
        tx: &Transaction,
        addresses: BTreeSet<String>,
        signals: &mut SignalBuffer,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        if self.records.contains_key(&txid) {
            return Err(WalletError::AlreadyExists(txid));
        }

        log::debug!("Ledger dispatch {}", txid);
        self.records.insert(
            txid,
            TxRecord {
                txid,
                tx: tx.clone(),
                status: TxStatus::Dispatch,
                height: 0,
                timestamp: wallet_clock(),
                is_block_timestamp: false,
                addresses,
            },
        );
        signals.push(Signal::SendTx(txid));
        signals.push(Signal::AddTx(txid));
        Ok(())
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<&Transaction> {
        self.records.get(txid).map(|r| &r.tx)
    }

    pub fn get_tx_data(&self, txid: &Txid) -> Option<&TxRecord> {
        self.records.get(txid)
    }

    pub fn get_tx_status(&self, txid: &Txid) -> TxStatus {
        self.records
            .get(txid)
            .map(|r| r.status)
            .unwrap_or(TxStatus::Unknown)
    }

    pub fn get_tx_height(&self, txid: &Txid) -> Option<u32> {
        self.records.get(txid).map(|r| r.height)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.records.contains_key(txid)
    }

    /// Tracked txids, optionally limited to those touching `addresses`
    pub fn get_all_tx_ids(&self, addresses: Option<&[String]>) -> Vec<Txid> {
        self.records
            .values()
            .filter(|r| match addresses {
                None => true,
                Some(addrs) => addrs.iter().any(|a| r.addresses.contains(a)),
            })
            .map(|r| r.txid)
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &TxRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record under an arbitrary key, bypassing txid checks
    #[cfg(test)]
    pub(crate) fn insert_record_unchecked(&mut self, record: TxRecord) {
        self.records.insert(record.txid, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn dummy_tx(value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let tx = dummy_tx(1000);

        ledger
            .add_tx(&tx, TxMeta::unconfirmed(), BTreeSet::new(), &mut signals)
            .unwrap();
        let err = ledger
            .add_tx(&tx, TxMeta::unconfirmed(), BTreeSet::new(), &mut signals)
            .unwrap_err();
        assert!(matches!(err, WalletError::AlreadyExists(_)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_block_timestamp_only_when_in_block() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let confirmed = dummy_tx(1);
        let mempool = dummy_tx(2);

        ledger
            .add_tx(&confirmed, TxMeta::confirmed(100, 1_600_000_000), BTreeSet::new(), &mut signals)
            .unwrap();
        let mut meta = TxMeta::unconfirmed();
        meta.timestamp = Some(42);
        ledger
            .add_tx(&mempool, meta, BTreeSet::new(), &mut signals)
            .unwrap();

        let record = ledger.get_tx_data(&confirmed.compute_txid()).unwrap();
        assert!(record.is_block_timestamp);
        assert_eq!(record.timestamp, 1_600_000_000);

        let record = ledger.get_tx_data(&mempool.compute_txid()).unwrap();
        assert!(!record.is_block_timestamp);
        assert_ne!(record.timestamp, 42);
    }

    #[test]
    fn test_self_tracked_ignores_unconfirmed() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let tx = dummy_tx(5000);
        let txid = tx.compute_txid();

        ledger.send_tx(&tx, BTreeSet::new(), &mut signals).unwrap();
        assert_eq!(
            signals.drain(),
            vec![Signal::SendTx(txid), Signal::AddTx(txid)]
        );

        let changed = ledger
            .update_tx(&txid, TxUpdate::status(TxStatus::Unconfirmed), &mut signals)
            .unwrap();
        assert!(!changed);
        assert_eq!(ledger.get_tx_status(&txid), TxStatus::Dispatch);
        assert!(signals.is_empty());

        ledger
            .update_tx(&txid, TxUpdate::status(TxStatus::Pending), &mut signals)
            .unwrap();
        ledger
            .update_tx(&txid, TxUpdate::status(TxStatus::Unconfirmed), &mut signals)
            .unwrap();
        assert_eq!(ledger.get_tx_status(&txid), TxStatus::Pending);

        let changed = ledger
            .update_tx(
                &txid,
                TxUpdate {
                    status: Some(TxStatus::Confirmed),
                    height: Some(200),
                    timestamp: Some(1_700_000_000),
                },
                &mut signals,
            )
            .unwrap();
        assert!(changed);
        let record = ledger.get_tx_data(&txid).unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.timestamp, 1_700_000_000);
        assert!(record.is_block_timestamp);
    }

    #[test]
    fn test_update_without_change_is_noop() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let tx = dummy_tx(7);
        let txid = tx.compute_txid();
        ledger
            .add_tx(&tx, TxMeta::unconfirmed(), BTreeSet::new(), &mut signals)
            .unwrap();
        signals.drain();

        let changed = ledger
            .update_tx(&txid, TxUpdate::default(), &mut signals)
            .unwrap();
        assert!(!changed);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_update_unknown_tx_fails() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let txid = dummy_tx(3).compute_txid();
        assert!(matches!(
            ledger.update_tx(&txid, TxUpdate::default(), &mut signals),
            Err(WalletError::NotFound(_))
        ));
    }

    #[test]
    fn test_record_serializes_status_as_code() {
        let mut ledger = Ledger::new();
        let mut signals = SignalBuffer::new();
        let tx = dummy_tx(9);
        ledger.send_tx(&tx, BTreeSet::new(), &mut signals).unwrap();

        let json = serde_json::to_value(&ledger).unwrap();
        let record = &json["records"][tx.compute_txid().to_string()];
        assert_eq!(record["status"], 5);

        let restored: Ledger = serde_json::from_value(json).unwrap();
        assert_eq!(restored.get_tx(&tx.compute_txid()), Some(&tx));
    }

    #[test]
    fn test_status_sets() {
        assert!(TxStatus::Dispatch.is_valid());
        assert!(TxStatus::Dispatch.is_available());
        assert!(TxStatus::Unconfirmed.is_valid());
        assert!(!TxStatus::Unconfirmed.is_available());
        assert!(!TxStatus::Invalid.is_valid());
        assert!(!TxStatus::Unknown.is_valid());
    }
}
