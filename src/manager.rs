//! Wallet state manager
//!
//! Owns the current [`WalletState`] and serializes every mutation through a
//! FIFO queue (tokio's mutex is fair). Each queued operation receives its own
//! clone of the committed state and hands it back together with an
//! [`Outcome`]. A committed snapshot is persisted (debounced, or immediately
//! when the operation asks for it), swapped in as the new current state and
//! only then are its buffered signals delivered. A discarded or failed
//! snapshot leaves no trace.
//!
//! Readers never wait for the queue: [`WalletStateManager::current`] clones
//! the `Arc` of the committed snapshot.

use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, Txid};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};

use crate::backend::Backend;
use crate::coins::FreezeOptions;
use crate::color::{resolve_output_colors, ColorOracle, ColorValue, TxSource};
use crate::config::StateConfig;
use crate::error::WalletError;
use crate::ledger::{Ledger, TxMeta, TxStatus, TxUpdate};
use crate::signal::Signal;
use crate::state::{StateContext, WalletState};
use crate::storage::{load_json, save_json, Store};
use crate::Result;

const SIGNAL_CAPACITY: usize = 1024;

/// What a queued operation wants done with its snapshot
#[derive(Debug)]
pub struct Outcome<T> {
    pub commit: bool,
    pub save_now: bool,
    pub value: T,
}

impl<T> Outcome<T> {
    pub fn commit(value: T) -> Self {
        Self {
            commit: true,
            save_now: false,
            value,
        }
    }

    pub fn discard(value: T) -> Self {
        Self {
            commit: false,
            save_now: false,
            value,
        }
    }

    /// Persist right after commit instead of waiting for the debounce
    pub fn save_now(mut self) -> Self {
        self.save_now = true;
        self
    }
}

struct Inner {
    config: StateConfig,
    current: RwLock<Arc<WalletState>>,
    context: RwLock<StateContext>,
    queue: Mutex<()>,
    queued: AtomicUsize,
    save_scheduled: AtomicBool,
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    oracle: Arc<dyn ColorOracle>,
    signals: broadcast::Sender<Signal>,
}

#[derive(Clone)]
pub struct WalletStateManager {
    inner: Arc<Inner>,
}

/// Resolves transactions from the ledger first, then from the backend
struct LedgerTxSource<'a> {
    ledger: &'a Ledger,
    backend: &'a dyn Backend,
}

#[async_trait]
impl TxSource for LedgerTxSource<'_> {
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction> {
        match self.ledger.get_tx(txid) {
            Some(tx) => Ok(tx.clone()),
            None => self.backend.get_tx(txid).await,
        }
    }
}

/// Keeps the busy counter honest even if the queued future is dropped
struct QueueTicket<'a> {
    inner: &'a Inner,
}

impl<'a> QueueTicket<'a> {
    fn enter(inner: &'a Inner) -> Self {
        if inner.queued.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = inner.signals.send(Signal::SyncStart);
        }
        Self { inner }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.inner.queued.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.inner.signals.send(Signal::SyncStop);
        }
    }
}

/// Status change observed for an already tracked transaction
struct StatusDelta {
    txid: Txid,
    status: TxStatus,
    height: u32,
}

impl WalletStateManager {
    pub fn new(
        config: StateConfig,
        context: StateContext,
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        oracle: Arc<dyn ColorOracle>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let state = WalletState::new(context.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                current: RwLock::new(Arc::new(state)),
                context: RwLock::new(context),
                queue: Mutex::new(()),
                queued: AtomicUsize::new(0),
                save_scheduled: AtomicBool::new(false),
                store,
                backend,
                oracle,
                signals,
            }),
        }
    }

    fn state_key(&self) -> String {
        format!("{}_state", self.inner.config.store_prefix)
    }

    /// Committed snapshot
    pub fn current(&self) -> Arc<WalletState> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn context(&self) -> StateContext {
        self.inner
            .context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Change the addresses/assets the indexes resolve against
    ///
    /// Takes effect for the next queued operation.
    pub fn update_context<F: FnOnce(&mut StateContext)>(&self, f: F) {
        let mut context = self
            .inner
            .context
            .write()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut context);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inner.signals.subscribe()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Run `op` against a private snapshot, in FIFO order with every other
    /// queued operation
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(WalletState) -> Fut + Send,
        Fut: Future<Output = Result<(WalletState, Outcome<T>)>> + Send,
        T: Send,
    {
        let _ticket = QueueTicket::enter(&self.inner);
        let _guard = self.inner.queue.lock().await;

        let mut snapshot = (*self.current()).clone();
        snapshot.set_context(self.context());

        match op(snapshot).await {
            Ok((mut state, outcome)) => {
                if !outcome.commit {
                    return Ok(outcome.value);
                }
                let signals = state.take_signals();
                let state = Arc::new(state);

                if outcome.save_now {
                    if let Err(e) = self.write_state(&state) {
                        log::error!("Failed to persist committed state: {}", e);
                        let _ = self.inner.signals.send(Signal::Error(e.to_string()));
                        return Err(e);
                    }
                } else {
                    self.schedule_save();
                }

                *self
                    .inner
                    .current
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = state;
                for signal in signals {
                    let _ = self.inner.signals.send(signal);
                }
                Ok(outcome.value)
            }
            Err(e) => {
                log::error!("Queued operation failed: {}", e);
                let _ = self.inner.signals.send(Signal::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn write_state(&self, state: &WalletState) -> Result<()> {
        save_json(self.inner.store.as_ref(), &self.state_key(), state)?;
        log::debug!("Wallet state saved ({} transactions)", state.ledger().len());
        Ok(())
    }

    /// Coalesce saves: one write per debounce window, of whatever is current
    fn schedule_save(&self) {
        if self.inner.save_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.config.save_debounce).await;
            this.inner.save_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = this.save_now() {
                log::warn!("Debounced save failed: {}", e);
            }
        });
    }

    /// Persist the current state immediately
    pub fn save_now(&self) -> Result<()> {
        let state = self.current();
        self.write_state(&state)
    }

    /// Hydrate from the store and resume broadcasting dispatched transactions
    pub async fn load(&self) -> Result<()> {
        let _guard = self.inner.queue.lock().await;
        let loaded: Option<WalletState> =
            load_json(self.inner.store.as_ref(), &self.state_key())?;
        let Some(mut state) = loaded else {
            log::info!("No stored wallet state, starting empty");
            return Ok(());
        };
        state.set_context(self.context());

        let dispatched: Vec<Transaction> = state
            .ledger()
            .records()
            .filter(|r| r.status == TxStatus::Dispatch)
            .map(|r| r.tx.clone())
            .collect();

        log::info!(
            "Loaded wallet state: {} transactions, height {}",
            state.ledger().len(),
            state.chain_height()
        );
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(state);

        for tx in dispatched {
            self.spawn_broadcast_retry(tx, 0);
        }
        Ok(())
    }

    /// Forget everything, in memory and in the store
    pub async fn clear(&self) -> Result<()> {
        self.execute(|state| async move {
            let mut fresh = WalletState::new(state.context().clone());
            fresh.signal(Signal::HistoryUpdate);
            Ok((fresh, Outcome::commit(()).save_now()))
        })
        .await?;
        self.inner
            .store
            .clear(&format!("{}_", self.inner.config.store_prefix))?;
        log::warn!("Wallet state cleared");
        Ok(())
    }

    async fn resolve_colors(
        inner: &Inner,
        state: &WalletState,
        tx: &Transaction,
    ) -> Result<Vec<ColorValue>> {
        let defs = state.context().registry.colors().colored();
        let source = LedgerTxSource {
            ledger: state.ledger(),
            backend: inner.backend.as_ref(),
        };
        resolve_output_colors(inner.oracle.as_ref(), tx, &defs, &source).await
    }

    /// Bring the tracked transactions of `addresses` in line with the backend
    ///
    /// Returns the number of transactions added or changed.
    pub async fn sync(&self, addresses: Vec<String>) -> Result<usize> {
        let this = self.clone();
        self.execute(move |mut state| async move {
            let inner = this.inner.as_ref();
            let backend = inner.backend.as_ref();

            let height_moved = match backend.get_tip_height().await {
                Ok(height) => state.set_chain_height(height),
                Err(e) => {
                    log::warn!("Could not fetch tip height: {}", e);
                    false
                }
            };

            let histories = join_all(addresses.iter().map(|a| backend.get_history(a))).await;
            let mut observed: HashMap<Txid, u32> = HashMap::new();
            for history in histories {
                for item in history? {
                    observed.insert(item.txid, item.height);
                }
            }

            let mut fresh = Vec::new();
            let mut changed = Vec::new();
            for (&txid, &height) in &observed {
                let status = if height > 0 {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Unconfirmed
                };
                match state.ledger().get_tx_data(&txid) {
                    None => fresh.push((txid, TxMeta { status, height, timestamp: None })),
                    // our own broadcast showing up in the mempool
                    Some(record)
                        if record.status.is_self_tracked()
                            && status == TxStatus::Unconfirmed
                            && record.height == height => {}
                    Some(record) if record.status != status || record.height != height => {
                        changed.push(StatusDelta { txid, status, height })
                    }
                    Some(_) => {}
                }
            }
            for txid in state.ledger().get_all_tx_ids(Some(addresses.as_slice())) {
                let status = state.ledger().get_tx_status(&txid);
                if observed.contains_key(&txid) || !status.is_valid() || status.is_self_tracked() {
                    continue;
                }
                log::info!("Transaction {} vanished from backend history", txid);
                changed.push(StatusDelta {
                    txid,
                    status: TxStatus::Invalid,
                    height: 0,
                });
            }

            if fresh.is_empty() && changed.is_empty() {
                log::debug!("Sync of {} addresses: no changes", addresses.len());
                let outcome = if height_moved {
                    Outcome::commit(0)
                } else {
                    Outcome::discard(0)
                };
                return Ok((state, outcome));
            }

            let heights: BTreeSet<u32> = fresh
                .iter()
                .map(|(_, meta)| meta.height)
                .chain(changed.iter().map(|d| d.height))
                .filter(|h| *h > 0)
                .collect();
            let times = join_all(heights.iter().map(|h| backend.get_block_time(*h))).await;
            let mut block_times = HashMap::new();
            for (height, time) in heights.iter().zip(times) {
                block_times.insert(*height, time?);
            }

            let fetched = join_all(fresh.iter().map(|(txid, _)| backend.get_tx(txid))).await;
            let mut new_txs = Vec::with_capacity(fresh.len());
            for ((txid, mut meta), tx) in fresh.into_iter().zip(fetched) {
                let tx = tx?;
                if tx.compute_txid() != txid {
                    return Err(WalletError::Backend(format!(
                        "backend returned a different transaction for {}",
                        txid
                    )));
                }
                meta.timestamp = block_times.get(&meta.height).copied();
                new_txs.push((tx, meta));
            }

            let mut save_now = false;
            let mut applied = new_txs.len();
            for (tx, meta) in dependency_order(new_txs) {
                let colors = Self::resolve_colors(inner, &state, &tx).await?;
                save_now |= meta.status == TxStatus::Confirmed;
                state.add_tx(&tx, meta, &colors)?;
            }

            for delta in changed {
                let was_valid = state.ledger().get_tx_status(&delta.txid).is_valid();
                let colors = if !was_valid && delta.status.is_valid() {
                    let tx = state
                        .ledger()
                        .get_tx(&delta.txid)
                        .cloned()
                        .ok_or_else(|| WalletError::tx_not_found(&delta.txid))?;
                    Some(Self::resolve_colors(inner, &state, &tx).await?)
                } else {
                    None
                };
                let update = TxUpdate {
                    status: Some(delta.status),
                    height: Some(delta.height),
                    timestamp: block_times.get(&delta.height).copied(),
                };
                if state.update_tx(&delta.txid, update, colors.as_deref())? {
                    applied += 1;
                    save_now |= matches!(delta.status, TxStatus::Confirmed | TxStatus::Invalid);
                }
            }

            if applied == 0 && !height_moved {
                log::debug!("Sync of {} addresses: no effective changes", addresses.len());
                return Ok((state, Outcome::discard(0)));
            }

            log::info!(
                "Sync of {} addresses applied {} changes",
                addresses.len(),
                applied
            );
            let outcome = Outcome::commit(applied);
            Ok((state, if save_now { outcome.save_now() } else { outcome }))
        })
        .await
    }

    /// Broadcast a wallet transaction and track it
    ///
    /// A transaction the backend rejects is still tracked as `Dispatch` and
    /// rebroadcast in the background; after the configured number of failed
    /// attempts it is marked `Invalid` and its effects are reverted.
    pub async fn send_tx(&self, tx: Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        if self.current().ledger().contains(&txid) {
            return Err(WalletError::AlreadyExists(txid));
        }

        match self.inner.backend.send_tx(&tx).await {
            Ok(_) => {
                log::info!("Broadcast {}", txid);
                self.record_sent(tx, true).await?;
            }
            Err(e) => {
                log::warn!("Broadcast of {} failed, will retry: {}", txid, e);
                self.record_sent(tx.clone(), false).await?;
                self.spawn_broadcast_retry(tx, 0);
            }
        }
        Ok(txid)
    }

    async fn record_sent(&self, tx: Transaction, accepted: bool) -> Result<()> {
        let this = self.clone();
        self.execute(move |mut state| async move {
            let colors = Self::resolve_colors(&this.inner, &state, &tx).await?;
            state.send_tx(&tx, &colors)?;
            if accepted {
                state.mark_pending(&tx.compute_txid())?;
            }
            Ok((state, Outcome::commit(()).save_now()))
        })
        .await
    }

    /// Rebroadcast with exponential backoff after broadcast number
    /// `failed_attempt` (0-based) was rejected
    fn spawn_broadcast_retry(&self, tx: Transaction, failed_attempt: u32) {
        let this = self.clone();
        tokio::spawn(async move {
            let txid = tx.compute_txid();
            let config = &this.inner.config;

            for attempt in failed_attempt..config.max_send_attempts.saturating_sub(1) {
                let delay = config.send_retry_base * 2u32.saturating_pow(attempt);
                tokio::time::sleep(delay).await;

                let status = this.current().ledger().get_tx_status(&txid);
                if status != TxStatus::Dispatch {
                    log::debug!("Stop rebroadcasting {}: now {:?}", txid, status);
                    return;
                }

                match this.inner.backend.send_tx(&tx).await {
                    Ok(_) => {
                        log::info!("Broadcast {} on retry {}", txid, attempt + 1);
                        let result = this
                            .execute(move |mut state| async move {
                                let changed = state.mark_pending(&txid)?;
                                let outcome = if changed {
                                    Outcome::commit(()).save_now()
                                } else {
                                    Outcome::discard(())
                                };
                                Ok((state, outcome))
                            })
                            .await;
                        if let Err(e) = result {
                            log::error!("Could not mark {} pending: {}", txid, e);
                        }
                        return;
                    }
                    Err(e) => log::warn!("Retry {} for {} failed: {}", attempt + 1, txid, e),
                }
            }

            log::error!("Giving up on {}, marking invalid", txid);
            let result = this
                .execute(move |mut state| async move {
                    if state.ledger().get_tx_status(&txid) != TxStatus::Dispatch {
                        return Ok((state, Outcome::discard(())));
                    }
                    state.update_tx(&txid, TxUpdate::status(TxStatus::Invalid), None)?;
                    Ok((state, Outcome::commit(()).save_now()))
                })
                .await;
            if let Err(e) = result {
                log::error!("Could not invalidate {}: {}", txid, e);
            }
        });
    }

    pub async fn freeze_coins(&self, outpoints: Vec<OutPoint>, opts: FreezeOptions) -> Result<()> {
        self.execute(move |mut state| async move {
            state.freeze_coins(&outpoints, opts)?;
            Ok((state, Outcome::commit(())))
        })
        .await
    }

    pub async fn unfreeze_coins(&self, outpoints: Vec<OutPoint>) -> Result<()> {
        self.execute(move |mut state| async move {
            state.unfreeze_coins(&outpoints);
            Ok((state, Outcome::commit(())))
        })
        .await
    }

    /// Record a new chain tip; freeze conditions are evaluated against it
    pub async fn on_new_height(&self, height: u32) -> Result<bool> {
        self.execute(move |mut state| async move {
            let moved = state.set_chain_height(height);
            let outcome = if moved {
                Outcome::commit(true)
            } else {
                Outcome::discard(false)
            };
            Ok((state, outcome))
        })
        .await
    }
}

/// Order a batch so that every transaction comes after the batch members it
/// spends from; confirmed before mempool, then by height
fn dependency_order(mut txs: Vec<(Transaction, TxMeta)>) -> Vec<(Transaction, TxMeta)> {
    txs.sort_by_key(|(_, meta)| if meta.height == 0 { u32::MAX } else { meta.height });

    let mut pending: HashSet<Txid> = txs.iter().map(|(tx, _)| tx.compute_txid()).collect();
    let mut ordered = Vec::with_capacity(txs.len());
    while !txs.is_empty() {
        let ready = txs.iter().position(|(tx, _)| {
            tx.input
                .iter()
                .all(|input| !pending.contains(&input.previous_output.txid))
        });
        // a cycle cannot be placed; history ordering reports it
        let index = ready.unwrap_or(0);
        let (tx, meta) = txs.remove(index);
        pending.remove(&tx.compute_txid());
        ordered.push((tx, meta));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn tx_spending(prev: OutPoint, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: prev,
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
    fn test_dependency_order_places_parent_first() {
        let parent = tx_spending(OutPoint::null(), 5000);
        let child = tx_spending(
            OutPoint {
                txid: parent.compute_txid(),
                vout: 0,
            },
            4000,
        );

        let ordered = dependency_order(vec![
            (child.clone(), TxMeta::confirmed(10, 0)),
            (parent.clone(), TxMeta::unconfirmed()),
        ]);
        let ids: Vec<Txid> = ordered.iter().map(|(tx, _)| tx.compute_txid()).collect();
        assert_eq!(ids, vec![parent.compute_txid(), child.compute_txid()]);
    }

    #[test]
    fn test_outcome_flags() {
        let outcome = Outcome::commit(1).save_now();
        assert!(outcome.commit && outcome.save_now);
        assert!(!Outcome::discard(()).commit);
    }
}
