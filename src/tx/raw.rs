use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Transaction, Txid};
use std::collections::BTreeMap;

use crate::color::{resolve_output_colors, ColorDefinition, ColorId, ColorOracle, ColorTarget, TxSource};
use crate::state::WalletState;
use crate::Result;

/// Signed change of one color for the wallet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorDelta {
    pub color_id: ColorId,
    pub value: i64,
}

/// A materialized bitcoin transaction, signed or not
#[derive(Clone, Debug, PartialEq)]
pub struct RawTx {
    tx: Transaction,
}

impl RawTx {
    pub fn new(tx: Transaction) -> Self {
        Self { tx }
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub(crate) fn tx_mut(&mut self) -> &mut Transaction {
        &mut self.tx
    }

    pub fn into_tx(self) -> Transaction {
        self.tx
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    /// Inputs carrying a witness or a scriptSig
    pub fn is_input_signed(&self, index: usize) -> bool {
        self.tx
            .input
            .get(index)
            .map_or(false, |i| !i.witness.is_empty() || !i.script_sig.is_empty())
    }

    pub fn is_fully_signed(&self) -> bool {
        (0..self.tx.input.len()).all(|i| self.is_input_signed(i))
    }

    /// Color value of every output, paired with its script
    pub async fn get_color_targets(
        &self,
        oracle: &dyn ColorOracle,
        color_defs: &[ColorDefinition],
        source: &dyn TxSource,
    ) -> Result<Vec<ColorTarget>> {
        let values = resolve_output_colors(oracle, &self.tx, color_defs, source).await?;
        Ok(self
            .tx
            .output
            .iter()
            .zip(values)
            .map(|(out, value)| ColorTarget {
                script: out.script_pubkey.clone(),
                value,
            })
            .collect())
    }

    /// Every target is paid by a distinct output; with `allow_extra` unset
    /// there must be no other outputs
    pub async fn satisfies_targets(
        &self,
        targets: &[ColorTarget],
        allow_extra: bool,
        oracle: &dyn ColorOracle,
        color_defs: &[ColorDefinition],
        source: &dyn TxSource,
    ) -> Result<bool> {
        let mut outputs = self.get_color_targets(oracle, color_defs, source).await?;
        for target in targets {
            match outputs.iter().position(|o| o == target) {
                Some(index) => {
                    outputs.remove(index);
                }
                None => return Ok(false),
            }
        }
        Ok(allow_extra || outputs.is_empty())
    }

    /// Per-color net change for the wallet owning `state`, non-zero entries only
    pub async fn get_deltas(
        &self,
        state: &WalletState,
        oracle: &dyn ColorOracle,
        color_defs: &[ColorDefinition],
        source: &dyn TxSource,
    ) -> Result<Vec<ColorDelta>> {
        let mut sums: BTreeMap<ColorId, i64> = BTreeMap::new();
        for input in &self.tx.input {
            if let Some(coin) = state.coins().get_coin(&input.previous_output) {
                *sums.entry(coin.color_value.color_id).or_default() -=
                    coin.color_value.value as i64;
            }
        }

        let outputs = self.get_color_targets(oracle, color_defs, source).await?;
        for target in outputs {
            if state.context().is_wallet_script(&target.script) {
                *sums.entry(target.value.color_id).or_default() += target.value.value as i64;
            }
        }

        Ok(sums
            .into_iter()
            .filter(|(_, value)| *value != 0)
            .map(|(color_id, value)| ColorDelta { color_id, value })
            .collect())
    }

    /// Every expected delta matches exactly; with `allow_extra` unset no
    /// other color may change
    pub async fn satisfies_deltas(
        &self,
        deltas: &[ColorDelta],
        allow_extra: bool,
        state: &WalletState,
        oracle: &dyn ColorOracle,
        color_defs: &[ColorDefinition],
        source: &dyn TxSource,
    ) -> Result<bool> {
        let actual = self.get_deltas(state, oracle, color_defs, source).await?;
        let value_of = |color_id: ColorId| {
            actual
                .iter()
                .find(|d| d.color_id == color_id)
                .map_or(0, |d| d.value)
        };

        if deltas.iter().any(|d| value_of(d.color_id) != d.value) {
            return Ok(false);
        }
        Ok(allow_extra
            || actual
                .iter()
                .all(|a| deltas.iter().any(|d| d.color_id == a.color_id)))
    }
}
