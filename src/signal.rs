//! Wallet signals
//!
//! Components never notify observers directly. Every signal raised while an
//! operation runs is pushed into a [`SignalBuffer`]; the state manager flushes
//! the buffer to subscribers only once the operation commits.

use bitcoin::Txid;
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    AddTx(Txid),
    UpdateTx(Txid),
    RevertTx(Txid),
    SendTx(Txid),
    TouchAddress(String),
    /// A color descriptor seen on-chain that no asset claims yet
    NewColor(String),
    TouchAsset(String),
    HistoryUpdate,
    SyncStart,
    SyncStop,
    NewHeight(u32),
    Error(String),
}

/// Order-preserving buffer that keeps the first occurrence of each signal
#[derive(Clone, Debug, Default)]
pub struct SignalBuffer {
    order: Vec<Signal>,
    seen: HashSet<Signal>,
}

impl SignalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: Signal) {
        if self.seen.insert(signal.clone()) {
            self.order.push(signal);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.order.iter()
    }

    /// Take every buffered signal, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<Signal> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_position() {
        let mut buffer = SignalBuffer::new();
        buffer.push(Signal::TouchAddress("a".into()));
        buffer.push(Signal::HistoryUpdate);
        buffer.push(Signal::TouchAddress("a".into()));
        buffer.push(Signal::TouchAddress("b".into()));
        buffer.push(Signal::HistoryUpdate);

        assert_eq!(
            buffer.drain(),
            vec![
                Signal::TouchAddress("a".into()),
                Signal::HistoryUpdate,
                Signal::TouchAddress("b".into()),
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_resets_dedup() {
        let mut buffer = SignalBuffer::new();
        buffer.push(Signal::SyncStart);
        buffer.drain();
        buffer.push(Signal::SyncStart);
        assert_eq!(buffer.len(), 1);
    }
}
