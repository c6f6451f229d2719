//! Transaction transform pipeline
//!
//! A spend request travels one way through these stages:
//!
//! ```text
//! AssetTx ──▶ OperationalTx ──▶ ComposedTx ──▶ RawTx ──▶ Signed
//!                                                  └──▶ PartiallySigned
//! ```
//!
//! - **AssetTx**: asset targets as requested by the user
//! - **OperationalTx**: the same targets expressed in one color
//! - **ComposedTx**: selected input coins plus outputs, change included
//! - **RawTx**: an unsigned bitcoin transaction
//! - **Signed / PartiallySigned**: every / some inputs carry a witness
//!
//! [`transform_tx`] walks a stage forward until it reaches the requested
//! [`TargetKind`]; a stage can never be moved backwards.

mod compose;
mod fee;
mod raw;
mod sign;

pub use compose::{
    select_coins, CoinSelection, ComposedTx, Composer, ComposerRegistry, UncoloredComposer,
};
pub use fee::{estimate_tx_size, FeeEstimator, FixedFeeEstimator, DUST_LIMIT};
pub use raw::{ColorDelta, RawTx};
pub use sign::sign_raw_tx;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::address::AddressManager;
use crate::asset::{AssetRegistry, AssetTarget};
use crate::backend::Backend;
use crate::color::{ColorId, ColorTarget};
use crate::error::WalletError;
use crate::state::WalletState;
use crate::Result;

/// Pipeline stage a transform can stop at, in pipeline order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    Asset,
    Operational,
    Composed,
    Raw,
    Signed,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Asset => "asset",
            Self::Operational => "operational",
            Self::Composed => "composed",
            Self::Raw => "raw",
            Self::Signed => "signed",
        };
        f.write_str(name)
    }
}

impl FromStr for TargetKind {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asset" => Ok(Self::Asset),
            "operational" => Ok(Self::Operational),
            "composed" => Ok(Self::Composed),
            "raw" => Ok(Self::Raw),
            "signed" => Ok(Self::Signed),
            other => Err(WalletError::TxKindNotRecognized(other.to_string())),
        }
    }
}

/// Requested transfer of one or more assets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetTx {
    pub targets: Vec<AssetTarget>,
}

/// Transfer expressed in a single color
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationalTx {
    pub targets: Vec<ColorTarget>,
}

impl OperationalTx {
    /// The one color every target is in
    pub fn color_id(&self) -> Result<ColorId> {
        let colors: BTreeSet<ColorId> = self.targets.iter().map(|t| t.value.color_id).collect();
        match colors.len() {
            1 => Ok(colors.into_iter().next().unwrap_or_default()),
            0 => Err(WalletError::Internal("transaction has no targets".to_string())),
            _ => Err(WalletError::MultiColorNotSupported(format!(
                "targets span colors {:?}",
                colors
            ))),
        }
    }

    pub fn total_value(&self) -> u64 {
        self.targets.iter().map(|t| t.value.value).sum()
    }
}

impl AssetTx {
    pub fn new(targets: Vec<AssetTarget>) -> Self {
        Self { targets }
    }

    /// Replace every asset target by a target in the asset's color
    pub fn to_operational(&self, registry: &AssetRegistry) -> Result<OperationalTx> {
        let mut targets = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let asset = registry
                .get_by_id(&target.value.asset_id)
                .ok_or_else(|| WalletError::NotFound(format!("asset {}", target.value.asset_id)))?;
            let defs = registry.color_defs_of(asset)?;
            let [def] = defs.as_slice() else {
                return Err(WalletError::MultiColorNotSupported(format!(
                    "asset {} has {} colors",
                    asset.id,
                    defs.len()
                )));
            };
            targets.push(ColorTarget {
                script: target.script.clone(),
                value: def.value(target.value.value),
            });
        }

        let operational = OperationalTx { targets };
        operational.color_id()?;
        Ok(operational)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TxStage {
    Asset(AssetTx),
    Operational(OperationalTx),
    Composed(ComposedTx),
    Raw(RawTx),
    Signed(RawTx),
    PartiallySigned(RawTx),
}

impl TxStage {
    /// A partially signed transaction still counts as raw: signing can resume
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Asset(_) => TargetKind::Asset,
            Self::Operational(_) => TargetKind::Operational,
            Self::Composed(_) => TargetKind::Composed,
            Self::Raw(_) | Self::PartiallySigned(_) => TargetKind::Raw,
            Self::Signed(_) => TargetKind::Signed,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed(_))
    }

    /// Underlying bitcoin transaction once materialized
    pub fn raw(&self) -> Option<&RawTx> {
        match self {
            Self::Raw(tx) | Self::Signed(tx) | Self::PartiallySigned(tx) => Some(tx),
            _ => None,
        }
    }
}

/// Everything a transform step may consult
pub struct TransformEnv<'a> {
    pub state: &'a WalletState,
    pub addresses: &'a dyn AddressManager,
    pub backend: &'a dyn Backend,
    pub composers: &'a ComposerRegistry,
    pub fee_estimator: Option<&'a dyn FeeEstimator>,
    /// Let coin selection use unconfirmed coins
    pub spend_unconfirmed: bool,
    /// Needed for signing and for deriving a first change address
    pub seed: Option<&'a [u8]>,
    /// Inputs to sign; every unsigned input when `None`
    pub sign_inputs: Option<&'a [usize]>,
}

impl<'a> TransformEnv<'a> {
    pub fn registry(&self) -> &'a AssetRegistry {
        &self.state.context().registry
    }
}

/// Advance `stage` until it is of kind `target`
pub async fn transform_tx(
    stage: TxStage,
    target: TargetKind,
    env: &TransformEnv<'_>,
) -> Result<TxStage> {
    if stage.kind() > target {
        return Err(WalletError::not_reachable(
            stage.kind().to_string(),
            target.to_string(),
        ));
    }

    let mut stage = stage;
    while stage.kind() != target {
        log::debug!("Transform {} -> {}", stage.kind(), target);
        stage = match stage {
            TxStage::Asset(tx) => TxStage::Operational(tx.to_operational(env.registry())?),
            TxStage::Operational(tx) => TxStage::Composed(env.composers.compose(&tx, env)?),
            TxStage::Composed(tx) => TxStage::Raw(tx.to_raw()),
            TxStage::Raw(tx) | TxStage::PartiallySigned(tx) => sign_raw_tx(tx, env).await?,
            TxStage::Signed(_) => {
                return Err(WalletError::not_reachable(
                    TargetKind::Signed.to_string(),
                    target.to_string(),
                ))
            }
        };
        // a partially signed result cannot progress further without another seed
        if matches!(stage, TxStage::PartiallySigned(_)) {
            break;
        }
    }
    Ok(stage)
}
