//! Wallet facade
//!
//! Ties configuration, key management, the asset registry, the backend and
//! the state manager together behind asset-level operations: deriving
//! addresses, syncing, building and sending transfers, balances and history.

use bitcoin::{Address, OutPoint, Txid};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::address::{AddressBook, AddressManager, HdAddressManager};
use crate::asset::{AssetDefinition, AssetRegistry, AssetTarget};
use crate::backend::{Backend, EsploraBackend};
use crate::coins::{CoinQuery, FreezeOptions};
use crate::color::{ColorDefinition, ColorOracle, UncoloredOracle};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::history::HistoryEntry;
use crate::manager::WalletStateManager;
use crate::signal::Signal;
use crate::state::{StateContext, WalletState};
use crate::storage::{load_json, save_json, FileStore, Store};
use crate::tx::{transform_tx, AssetTx, ComposerRegistry, FixedFeeEstimator, TargetKind, TransformEnv, TxStage};
use crate::Result;

/// Balance of one asset, in base units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Spendable now: unspent, confirmed or self-broadcast, not frozen
    pub available: u64,
    /// Unspent coins from transactions still in the mempool
    pub unconfirmed: u64,
    /// Every unspent coin, frozen and unconfirmed included
    pub total: u64,
}

pub struct Wallet {
    config: WalletConfig,
    store: Arc<dyn Store>,
    addresses: Arc<HdAddressManager>,
    manager: WalletStateManager,
    composers: ComposerRegistry,
    fee_estimator: FixedFeeEstimator,
}

impl Wallet {
    /// Open the wallet stored under `config.data_dir`, talking to Esplora
    pub async fn open(config: WalletConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new_with_base_dir(config.data_dir.clone()));
        let backend = Arc::new(EsploraBackend::new(config.esplora_url.clone()));
        Self::with_parts(config, store, backend, Arc::new(UncoloredOracle)).await
    }

    /// Open with explicit collaborators
    pub async fn with_parts(
        config: WalletConfig,
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        oracle: Arc<dyn ColorOracle>,
    ) -> Result<Self> {
        let prefix = &config.state.store_prefix;
        let book: AddressBook =
            load_json(store.as_ref(), &format!("{}_addresses", prefix))?.unwrap_or_default();
        let registry: AssetRegistry =
            load_json(store.as_ref(), &format!("{}_assets", prefix))?.unwrap_or_default();
        let addresses = Arc::new(HdAddressManager::with_book(config.network, book));

        let mut context = StateContext::new(config.network);
        context.registry = registry;
        context.addresses = addresses
            .get_wallet_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();

        let manager =
            WalletStateManager::new(config.state.clone(), context, store.clone(), backend, oracle);
        manager.load().await?;

        log::info!(
            "Wallet opened on {:?} with {} addresses",
            config.network,
            addresses.get_wallet_addresses().len()
        );
        Ok(Self {
            fee_estimator: FixedFeeEstimator::new(config.fee_rate_sat_vb),
            config,
            store,
            addresses,
            manager,
            composers: ComposerRegistry::new(),
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn manager(&self) -> &WalletStateManager {
        &self.manager
    }

    pub fn composers_mut(&mut self) -> &mut ComposerRegistry {
        &mut self.composers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.manager.subscribe()
    }

    fn key(&self, name: &str) -> String {
        format!("{}_{}", self.config.state.store_prefix, name)
    }

    /// Committed state with the latest addresses and assets attached
    fn state(&self) -> WalletState {
        let mut state = (*self.manager.current()).clone();
        state.set_context(self.manager.context());
        state
    }

    /// Push derived addresses into the state context and persist the book
    fn refresh_addresses(&self) -> Result<()> {
        let addresses: Vec<String> = self
            .addresses
            .get_wallet_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        self.manager.update_context(|ctx| ctx.addresses.extend(addresses));
        save_json(self.store.as_ref(), &self.key("addresses"), &self.addresses.book())?;
        Ok(())
    }

    /// Asset by id or moniker
    pub fn get_asset(&self, asset: &str) -> Result<AssetDefinition> {
        let ctx = self.manager.context();
        ctx.registry
            .get_by_id(asset)
            .or_else(|| ctx.registry.get_by_moniker(asset))
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("asset {}", asset)))
    }

    pub fn get_assets(&self) -> Vec<AssetDefinition> {
        self.manager.context().registry.get_assets().to_vec()
    }

    pub fn add_asset(&self, asset: AssetDefinition) -> Result<AssetDefinition> {
        let mut result = None;
        self.manager
            .update_context(|ctx| result = Some(ctx.registry.add_asset(asset)));
        let added = result.ok_or_else(|| WalletError::Internal("context not updated".to_string()))??;
        save_json(
            self.store.as_ref(),
            &self.key("assets"),
            &self.manager.context().registry,
        )?;
        Ok(added)
    }

    fn color_defs(&self, asset: &AssetDefinition) -> Result<Vec<ColorDefinition>> {
        self.manager.context().registry.color_defs_of(asset)
    }

    /// Single color of a mono-color asset
    fn sole_color(&self, asset: &AssetDefinition) -> Result<ColorDefinition> {
        let defs = self.color_defs(asset)?;
        match <[ColorDefinition; 1]>::try_from(defs) {
            Ok([def]) => Ok(def),
            Err(defs) => Err(WalletError::MultiColorNotSupported(format!(
                "asset {} has {} colors",
                asset.id,
                defs.len()
            ))),
        }
    }

    pub fn get_all_addresses(&self, asset: &str) -> Result<Vec<Address>> {
        let color = self.sole_color(&self.get_asset(asset)?)?;
        Ok(self.addresses.get_all_addresses(&color))
    }

    pub async fn get_new_address(&self, asset: &str, seed: &[u8]) -> Result<Address> {
        let color = self.sole_color(&self.get_asset(asset)?)?;
        let address = self.addresses.get_new_address(&color, seed)?;
        self.refresh_addresses()?;
        self.manager
            .backend()
            .subscribe_address(&address.to_string())
            .await?;
        Ok(address)
    }

    /// Sync every derived address
    pub async fn sync_all(&self) -> Result<usize> {
        let addresses: Vec<String> = self
            .addresses
            .get_wallet_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        if addresses.is_empty() {
            return Ok(0);
        }
        self.manager.sync(addresses).await
    }

    /// Poll the backend tip and record it
    pub async fn update_height(&self) -> Result<u32> {
        let height = self.manager.backend().get_tip_height().await?;
        self.manager.on_new_height(height).await?;
        Ok(height)
    }

    /// Move an existing stage further down the pipeline
    pub async fn transform_tx(
        &self,
        stage: TxStage,
        target: TargetKind,
        seed: Option<&[u8]>,
    ) -> Result<TxStage> {
        self.transform_with(stage, target, seed, None).await
    }

    /// Sign only the listed inputs of a raw or partially signed transaction
    pub async fn sign_inputs(&self, stage: TxStage, seed: &[u8], inputs: &[usize]) -> Result<TxStage> {
        self.transform_with(stage, TargetKind::Signed, Some(seed), Some(inputs))
            .await
    }

    async fn transform_with(
        &self,
        stage: TxStage,
        target: TargetKind,
        seed: Option<&[u8]>,
        sign_inputs: Option<&[usize]>,
    ) -> Result<TxStage> {
        let state = self.state();
        let env = TransformEnv {
            state: &state,
            addresses: self.addresses.as_ref(),
            backend: self.manager.backend().as_ref(),
            composers: &self.composers,
            fee_estimator: Some(&self.fee_estimator),
            spend_unconfirmed: self.config.spend_unconfirmed,
            seed,
            sign_inputs,
        };
        let result = transform_tx(stage, target, &env).await?;
        // composing may have derived a change address
        self.refresh_addresses()?;
        Ok(result)
    }

    /// Build a transfer of `targets` up to `target`
    pub async fn create_tx(
        &self,
        targets: Vec<AssetTarget>,
        target: TargetKind,
        seed: Option<&[u8]>,
    ) -> Result<TxStage> {
        self.transform_tx(TxStage::Asset(AssetTx::new(targets)), target, seed)
            .await
    }

    /// Broadcast a fully signed stage
    pub async fn send_tx(&self, stage: TxStage) -> Result<Txid> {
        match stage {
            TxStage::Signed(raw) => self.manager.send_tx(raw.into_tx()).await,
            other => Err(WalletError::not_reachable(
                other.kind().to_string(),
                TargetKind::Signed.to_string(),
            )),
        }
    }

    /// Build, sign and broadcast a transfer
    pub async fn send(&self, targets: Vec<AssetTarget>, seed: &[u8]) -> Result<Txid> {
        let stage = self.create_tx(targets, TargetKind::Signed, Some(seed)).await?;
        self.send_tx(stage).await
    }

    pub fn get_balance(&self, asset: &str) -> Result<Balance> {
        let defs = self.color_defs(&self.get_asset(asset)?)?;
        let state = self.manager.current();
        let query = CoinQuery::new().only_colored_as(&defs);
        let sum = |q: CoinQuery| -> u64 {
            q.get_coins(&state)
                .total_value()
                .iter()
                .map(|v| v.value)
                .sum()
        };

        Ok(Balance {
            available: sum(query.clone()),
            unconfirmed: sum(query.only_unconfirmed()),
            total: sum(query.include_unconfirmed().include_frozen()),
        })
    }

    pub fn get_history(&self, asset: Option<&str>) -> Result<Vec<HistoryEntry>> {
        let asset_id = match asset {
            Some(a) => Some(self.get_asset(a)?.id),
            None => None,
        };
        Ok(self.manager.current().history().get_entries(asset_id.as_deref()))
    }

    pub async fn freeze_coins(&self, outpoints: Vec<OutPoint>, opts: FreezeOptions) -> Result<()> {
        self.manager.freeze_coins(outpoints, opts).await
    }

    pub async fn unfreeze_coins(&self, outpoints: Vec<OutPoint>) -> Result<()> {
        self.manager.unfreeze_coins(outpoints).await
    }

    /// Flush pending state to the store
    pub fn save(&self) -> Result<()> {
        self.manager.save_now()
    }
}
