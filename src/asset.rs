//! Asset definitions
//!
//! An asset groups one or more color descriptors under human-readable
//! monikers and a display unit. [`AssetRegistry`] pairs the asset list with
//! the color registry so that a color id can be mapped back to its asset.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};

use crate::color::{ColorDefinition, ColorDefinitionManager, ColorId};
use crate::error::WalletError;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDefinition {
    pub id: String,
    pub monikers: Vec<String>,
    pub color_descs: Vec<String>,
    pub unit: u64,
}

impl AssetDefinition {
    pub fn new(monikers: Vec<String>, color_descs: Vec<String>, unit: u64) -> Self {
        Self {
            id: Self::compute_id(&color_descs),
            monikers,
            color_descs,
            unit,
        }
    }

    /// Plain bitcoin, the asset every wallet starts with
    pub fn bitcoin() -> Self {
        Self::new(vec!["bitcoin".to_string()], vec![String::new()], 100_000_000)
    }

    pub fn moniker(&self) -> &str {
        self.monikers.first().map(String::as_str).unwrap_or("")
    }

    /// Stable id derived from the sorted descriptor list
    fn compute_id(color_descs: &[String]) -> String {
        let mut sorted = color_descs.to_vec();
        sorted.sort();
        let digest = sha256::Hash::hash(sorted.join(";").as_bytes());
        hex::encode(&digest.to_byte_array()[..10])
    }
}

/// An asset quantity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetValue {
    pub asset_id: String,
    pub value: u64,
}

/// An asset quantity destined to a script
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTarget {
    pub script: ScriptBuf,
    pub value: AssetValue,
}

/// Known assets together with the color registry they refer to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetRegistry {
    colors: ColorDefinitionManager,
    assets: Vec<AssetDefinition>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            colors: ColorDefinitionManager::new(),
            assets: vec![AssetDefinition::bitcoin()],
        }
    }

    pub fn colors(&self) -> &ColorDefinitionManager {
        &self.colors
    }

    pub fn colors_mut(&mut self) -> &mut ColorDefinitionManager {
        &mut self.colors
    }

    /// Register an asset; every descriptor it names is registered as a color
    pub fn add_asset(&mut self, asset: AssetDefinition) -> Result<AssetDefinition> {
        if self.assets.iter().any(|a| a.id == asset.id) {
            return Err(WalletError::Internal(format!(
                "asset {} already registered",
                asset.id
            )));
        }
        for desc in &asset.color_descs {
            self.colors.resolve(desc)?;
        }
        log::info!(
            "Registered asset {} ({} color definitions)",
            asset.moniker(),
            asset.color_descs.len()
        );
        self.assets.push(asset.clone());
        Ok(asset)
    }

    pub fn get_assets(&self) -> &[AssetDefinition] {
        &self.assets
    }

    pub fn get_by_id(&self, id: &str) -> Option<&AssetDefinition> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn get_by_moniker(&self, moniker: &str) -> Option<&AssetDefinition> {
        self.assets
            .iter()
            .find(|a| a.monikers.iter().any(|m| m == moniker))
    }

    /// Asset owning a color id
    ///
    /// `Ok(None)` for colors no asset claims, an error when more than one does.
    pub fn asset_for_color(&self, color_id: ColorId) -> Result<Option<&AssetDefinition>> {
        let Some(def) = self.colors.get(color_id) else {
            return Ok(None);
        };
        let mut owners = self
            .assets
            .iter()
            .filter(|a| a.color_descs.iter().any(|d| d == def.desc()));
        let first = owners.next();
        if owners.next().is_some() {
            return Err(WalletError::MultiAssetTransactionNotSupported(format!(
                "color {} belongs to several assets",
                def.desc()
            )));
        }
        Ok(first)
    }

    /// Color definitions of an asset, in declaration order
    pub fn color_defs_of(&self, asset: &AssetDefinition) -> Result<Vec<ColorDefinition>> {
        asset
            .color_descs
            .iter()
            .map(|desc| {
                self.colors
                    .get_by_desc(desc)
                    .cloned()
                    .ok_or_else(|| WalletError::NotFound(format!("color definition {}", desc)))
            })
            .collect()
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
