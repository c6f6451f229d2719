//! Color definitions and color values
//!
//! A color definition is identified by its descriptor (`cdesc`). The empty
//! descriptor is plain bitcoin ("uncolored"); colored descriptors look like
//! `epobc:<genesis txid>:<genesis vout>:<genesis height>`. The propagation of
//! color values through transactions is delegated to a [`ColorOracle`].

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::WalletError;
use crate::Result;

/// Wallet-local numeric id of a color definition
pub type ColorId = u32;

/// Id reserved for plain bitcoin
pub const UNCOLORED_ID: ColorId = 0;

/// Color algorithm family, derived from the descriptor prefix
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColorKind {
    Uncolored,
    Epobc,
    Other(String),
}

impl fmt::Display for ColorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncolored => write!(f, "uncolored"),
            Self::Epobc => write!(f, "epobc"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorDefinition {
    id: ColorId,
    desc: String,
}

impl ColorDefinition {
    pub fn uncolored() -> Self {
        Self {
            id: UNCOLORED_ID,
            desc: String::new(),
        }
    }

    pub fn id(&self) -> ColorId {
        self.id
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn is_uncolored(&self) -> bool {
        self.desc.is_empty()
    }

    pub fn kind(&self) -> ColorKind {
        match self.desc.split(':').next() {
            None | Some("") => ColorKind::Uncolored,
            Some("epobc") => ColorKind::Epobc,
            Some(other) => ColorKind::Other(other.to_string()),
        }
    }

    /// Genesis outpoint of a colored definition
    pub fn genesis(&self) -> Option<OutPoint> {
        let mut parts = self.desc.split(':').skip(1);
        let txid = Txid::from_str(parts.next()?).ok()?;
        let vout = parts.next()?.parse().ok()?;
        Some(OutPoint { txid, vout })
    }

    pub fn value(&self, value: u64) -> ColorValue {
        ColorValue {
            color_id: self.id,
            value,
        }
    }

    fn validate(desc: &str) -> Result<()> {
        if desc.is_empty() {
            return Ok(());
        }
        let parts: Vec<&str> = desc.split(':').collect();
        if parts[0] == "epobc" {
            let well_formed = parts.len() == 4
                && Txid::from_str(parts[1]).is_ok()
                && parts[2].parse::<u32>().is_ok()
                && parts[3].parse::<u32>().is_ok();
            if !well_formed {
                return Err(WalletError::InvalidColorDesc(desc.to_string()));
            }
        }
        Ok(())
    }
}

/// A quantity of one color
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorValue {
    pub color_id: ColorId,
    pub value: u64,
}

impl ColorValue {
    pub fn is_uncolored(&self) -> bool {
        self.color_id == UNCOLORED_ID
    }
}

/// A color value destined to a script
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorTarget {
    pub script: ScriptBuf,
    pub value: ColorValue,
}

/// Registry mapping descriptors to wallet-local ids
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColorDefinitionManager {
    defs: BTreeMap<ColorId, ColorDefinition>,
    next_id: ColorId,
}

impl ColorDefinitionManager {
    pub fn new() -> Self {
        let mut defs = BTreeMap::new();
        defs.insert(UNCOLORED_ID, ColorDefinition::uncolored());
        Self { defs, next_id: 1 }
    }

    /// Get the definition for `desc`, registering it on first use
    pub fn resolve(&mut self, desc: &str) -> Result<ColorDefinition> {
        if let Some(def) = self.get_by_desc(desc) {
            return Ok(def.clone());
        }
        ColorDefinition::validate(desc)?;

        let def = ColorDefinition {
            id: self.next_id,
            desc: desc.to_string(),
        };
        self.next_id += 1;
        self.defs.insert(def.id, def.clone());
        log::debug!("Registered color definition {} as id {}", desc, def.id);
        Ok(def)
    }

    pub fn get(&self, id: ColorId) -> Option<&ColorDefinition> {
        self.defs.get(&id)
    }

    pub fn get_by_desc(&self, desc: &str) -> Option<&ColorDefinition> {
        self.defs.values().find(|d| d.desc == desc)
    }

    /// Every colored definition (plain bitcoin excluded)
    pub fn colored(&self) -> Vec<ColorDefinition> {
        self.defs
            .values()
            .filter(|d| !d.is_uncolored())
            .cloned()
            .collect()
    }
}

impl Default for ColorDefinitionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup of raw transactions used by color kernels to walk back
#[async_trait]
pub trait TxSource: Send + Sync {
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction>;
}

/// Computes per-output color values of a transaction
///
/// Returns one entry per output: `Some` when one of `color_defs` claims the
/// output, `None` when it carries no color from that set.
#[async_trait]
pub trait ColorOracle: Send + Sync {
    async fn get_color_values(
        &self,
        tx: &Transaction,
        color_defs: &[ColorDefinition],
        source: &dyn TxSource,
    ) -> Result<Vec<Option<ColorValue>>>;
}

/// Oracle for wallets that only hold plain bitcoin
pub struct UncoloredOracle;

#[async_trait]
impl ColorOracle for UncoloredOracle {
    async fn get_color_values(
        &self,
        tx: &Transaction,
        _color_defs: &[ColorDefinition],
        _source: &dyn TxSource,
    ) -> Result<Vec<Option<ColorValue>>> {
        Ok(vec![None; tx.output.len()])
    }
}

/// Resolve one color value per output, falling back to plain bitcoin
pub async fn resolve_output_colors(
    oracle: &dyn ColorOracle,
    tx: &Transaction,
    color_defs: &[ColorDefinition],
    source: &dyn TxSource,
) -> Result<Vec<ColorValue>> {
    let values = if color_defs.is_empty() {
        vec![None; tx.output.len()]
    } else {
        oracle.get_color_values(tx, color_defs, source).await?
    };

    if values.len() != tx.output.len() {
        return Err(WalletError::Internal(format!(
            "color oracle returned {} values for {} outputs",
            values.len(),
            tx.output.len()
        )));
    }

    Ok(tx
        .output
        .iter()
        .zip(values)
        .map(|(out, value)| {
            value.unwrap_or(ColorValue {
                color_id: UNCOLORED_ID,
                value: out.value.to_sat(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    #[test]
    fn test_uncolored_definition() {
        let manager = ColorDefinitionManager::new();
        let def = manager.get(UNCOLORED_ID).unwrap();
        assert!(def.is_uncolored());
        assert_eq!(def.kind(), ColorKind::Uncolored);
        assert!(def.genesis().is_none());
    }

    #[test]
    fn test_resolve_registers_once() {
        let mut manager = ColorDefinitionManager::new();
        let desc = format!("epobc:{}:0:0", GENESIS);
        let first = manager.resolve(&desc).unwrap();
        let second = manager.resolve(&desc).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id(), 1);
        assert_eq!(first.kind(), ColorKind::Epobc);
        assert_eq!(first.genesis().unwrap().vout, 0);
        assert_eq!(manager.colored().len(), 1);
    }

    #[test]
    fn test_malformed_epobc_rejected() {
        let mut manager = ColorDefinitionManager::new();
        let err = manager.resolve("epobc:nothex:0:0").unwrap_err();
        assert!(matches!(err, WalletError::InvalidColorDesc(_)));
    }
}
