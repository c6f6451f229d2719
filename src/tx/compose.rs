use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::collections::HashMap;
use std::sync::Arc;

use super::fee::{FeeEstimator, DUST_LIMIT};
use super::raw::RawTx;
use super::{OperationalTx, TransformEnv};
use crate::coins::{CoinQuery, CoinRecord};
use crate::color::{ColorDefinition, ColorKind, ColorTarget};
use crate::error::WalletError;
use crate::state::WalletState;
use crate::Result;

/// Inputs and outputs chosen for a transfer, not yet a bitcoin transaction
#[derive(Clone, Debug, PartialEq)]
pub struct ComposedTx {
    pub inputs: Vec<CoinRecord>,
    pub outputs: Vec<ColorTarget>,
    pub fee: u64,
}

impl ComposedTx {
    /// Materialize as an unsigned version 2 transaction with final sequences
    pub fn to_raw(&self) -> RawTx {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|coin| TxIn {
                    previous_output: coin.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: self
                .outputs
                .iter()
                .map(|target| TxOut {
                    value: Amount::from_sat(target.value.value),
                    script_pubkey: target.script.clone(),
                })
                .collect(),
        };
        RawTx::new(tx)
    }

    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|c| c.value).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoinSelection {
    pub coins: Vec<CoinRecord>,
    /// Summed color value of `coins`
    pub total: u64,
    /// Fee the selection had to cover, 0 for colored selections
    pub fee: u64,
}

/// Greedy coin selection in query order
///
/// The fee is estimated once from the number of candidate coins and
/// `num_outputs`, and only for uncolored selections.
pub fn select_coins(
    state: &WalletState,
    color: &ColorDefinition,
    value: u64,
    fee_estimator: Option<&dyn FeeEstimator>,
    num_outputs: usize,
    spend_unconfirmed: bool,
) -> Result<CoinSelection> {
    let mut query = CoinQuery::new().only_colored_as(std::slice::from_ref(color));
    if spend_unconfirmed {
        query = query.include_unconfirmed();
    }
    let candidates = query.get_coins(state);

    let fee = match fee_estimator {
        Some(estimator) if color.is_uncolored() => {
            estimator.estimate_fee(candidates.len(), num_outputs)
        }
        _ => 0,
    };
    let required = value.saturating_add(fee);

    let mut selected = Vec::new();
    let mut total = 0u64;
    for coin in candidates.iter() {
        if total >= required {
            break;
        }
        total += coin.color_value.value;
        selected.push(coin.clone());
    }

    if total < required {
        return Err(WalletError::InsufficientFunds(format!(
            "need {} of color {} (fee {}), only {} available",
            required,
            color.id(),
            fee,
            total
        )));
    }

    log::debug!(
        "Selected {} of {} coins ({} for {} + fee {})",
        selected.len(),
        candidates.len(),
        total,
        value,
        fee
    );
    Ok(CoinSelection {
        coins: selected,
        total,
        fee,
    })
}

/// Turns a mono-color transfer into selected inputs and outputs
pub trait Composer: Send + Sync {
    fn compose(
        &self,
        tx: &OperationalTx,
        color: &ColorDefinition,
        env: &TransformEnv<'_>,
    ) -> Result<ComposedTx>;
}

/// Composers keyed by color kind
#[derive(Clone)]
pub struct ComposerRegistry {
    composers: HashMap<String, Arc<dyn Composer>>,
}

impl ComposerRegistry {
    /// Registry with the built-in uncolored composer
    pub fn new() -> Self {
        let mut registry = Self {
            composers: HashMap::new(),
        };
        registry.register(ColorKind::Uncolored, Arc::new(UncoloredComposer));
        registry
    }

    pub fn register(&mut self, kind: ColorKind, composer: Arc<dyn Composer>) {
        self.composers.insert(kind.to_string(), composer);
    }

    pub fn compose(&self, tx: &OperationalTx, env: &TransformEnv<'_>) -> Result<ComposedTx> {
        let color_id = tx.color_id()?;
        let color = env
            .registry()
            .colors()
            .get(color_id)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("color definition {}", color_id)))?;
        let kind = color.kind().to_string();
        let composer = self
            .composers
            .get(&kind)
            .ok_or(WalletError::ComposerFunctionNotFound(kind))?;
        composer.compose(tx, &color, env)
    }
}

impl Default for ComposerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Change goes to the first address of the color, derived if there is none
fn change_address(color: &ColorDefinition, env: &TransformEnv<'_>) -> Result<Address> {
    if let Some(address) = env.addresses.get_all_addresses(color).into_iter().next() {
        return Ok(address);
    }
    let seed = env.seed.ok_or_else(|| {
        WalletError::NotFound(format!(
            "change address for color {} (no address and no seed to derive one)",
            color.id()
        ))
    })?;
    env.addresses.get_new_address(color, seed)
}

/// Plain bitcoin transfers
pub struct UncoloredComposer;

impl Composer for UncoloredComposer {
    fn compose(
        &self,
        tx: &OperationalTx,
        color: &ColorDefinition,
        env: &TransformEnv<'_>,
    ) -> Result<ComposedTx> {
        let value = tx.total_value();
        let selection = select_coins(
            env.state,
            color,
            value,
            env.fee_estimator,
            tx.targets.len() + 1,
            env.spend_unconfirmed,
        )?;

        let mut outputs = tx.targets.clone();
        let change = selection.total - value - selection.fee;
        let fee = if change >= DUST_LIMIT {
            let address = change_address(color, env)?;
            outputs.push(ColorTarget {
                script: address.script_pubkey(),
                value: color.value(change),
            });
            selection.fee
        } else {
            selection.fee + change
        };

        log::info!(
            "Composed transfer of {} sats: {} inputs, {} outputs, fee {}",
            value,
            selection.coins.len(),
            outputs.len(),
            fee
        );
        Ok(ComposedTx {
            inputs: selection.coins,
            outputs,
            fee,
        })
    }
}
