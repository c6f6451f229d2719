//! Wallet configuration from environment variables
//!
//! Controls Bitcoin network type, Esplora API endpoint, on-disk location of
//! the wallet state and the spending policy used by coin selection.
//! Defaults to Signet.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Bitcoin network type
    pub network: bitcoin::Network,
    /// Esplora API base URL
    pub esplora_url: String,
    /// Directory used by the file-system store
    pub data_dir: PathBuf,
    /// Allow coin selection to spend unconfirmed coins
    pub spend_unconfirmed: bool,
    /// Fee rate used by the default fee estimator
    pub fee_rate_sat_vb: u64,
    /// Execution queue and persistence tuning
    pub state: StateConfig,
}

/// Tuning for the state manager
#[derive(Clone, Debug)]
pub struct StateConfig {
    /// Store key prefix for everything this wallet persists
    pub store_prefix: String,
    /// Delay used to coalesce bursts of persistence writes
    pub save_debounce: Duration,
    /// Base delay for broadcast retries (doubled per attempt)
    pub send_retry_base: Duration,
    /// Broadcast attempts before a dispatched tx is marked invalid
    pub max_send_attempts: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            store_prefix: "cc_wallet".to_string(),
            save_debounce: Duration::from_millis(1000),
            send_retry_base: Duration::from_millis(15_000),
            max_send_attempts: 5,
        }
    }
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BITCOIN_NETWORK`: "signet" (default), "regtest", "testnet" or "bitcoin"
    /// - `ESPLORA_URL`: Esplora API endpoint (optional, has sensible defaults)
    /// - `WALLET_DATA_DIR`: directory for persisted state (default "./wallets")
    /// - `SPEND_UNCONFIRMED`: "true" to let coin selection use unconfirmed coins
    /// - `FEE_RATE_SAT_VB`: fee rate for the default estimator (default 2)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Use Regtest with a local Esplora instance
    /// BITCOIN_NETWORK=regtest ESPLORA_URL=http://localhost:3000 cargo test
    /// ```
    pub fn from_env() -> Self {
        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "signet".to_string())
            .to_lowercase();

        let network = Self::parse_network(&network_str);

        let esplora_url = env::var("ESPLORA_URL").unwrap_or_else(|_| {
            let url = Self::default_esplora_url(network);
            log::info!("Esplora URL: {} (default for {})", url, network);
            url
        });

        let data_dir = env::var("WALLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./wallets"));

        let spend_unconfirmed = env::var("SPEND_UNCONFIRMED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let fee_rate_sat_vb = env::var("FEE_RATE_SAT_VB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        Self {
            network,
            esplora_url,
            data_dir,
            spend_unconfirmed,
            fee_rate_sat_vb,
            state: StateConfig::default(),
        }
    }

    fn parse_network(name: &str) -> bitcoin::Network {
        match name {
            "regtest" => {
                log::info!("Using REGTEST network");
                bitcoin::Network::Regtest
            }
            "testnet" => {
                log::info!("Using TESTNET network");
                bitcoin::Network::Testnet
            }
            "bitcoin" | "mainnet" => {
                log::info!("Using MAINNET network");
                bitcoin::Network::Bitcoin
            }
            "signet" | "" => {
                log::info!("Using SIGNET network");
                bitcoin::Network::Signet
            }
            other => {
                log::warn!("Unknown network '{}', defaulting to Signet", other);
                bitcoin::Network::Signet
            }
        }
    }

    fn default_esplora_url(network: bitcoin::Network) -> String {
        match network {
            bitcoin::Network::Regtest => "http://localhost:3000".to_string(),
            bitcoin::Network::Testnet => "https://mempool.space/testnet/api".to_string(),
            bitcoin::Network::Bitcoin => "https://mempool.space/api".to_string(),
            _ => "https://mempool.space/signet/api".to_string(),
        }
    }

    /// Get the BIP44 coin type for this network
    ///
    /// - Mainnet: 0
    /// - Testnet/Signet/Regtest: 1
    pub fn coin_type(&self) -> u32 {
        match self.network {
            bitcoin::Network::Bitcoin => 0,
            _ => 1,
        }
    }
}

impl Default for WalletConfig {
    /// Default configuration (Signet)
    fn default() -> Self {
        Self {
            network: bitcoin::Network::Signet,
            esplora_url: "https://mempool.space/signet/api".to_string(),
            data_dir: PathBuf::from("./wallets"),
            spend_unconfirmed: false,
            fee_rate_sat_vb: 2,
            state: StateConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_signet() {
        let config = WalletConfig::default();
        assert!(matches!(config.network, bitcoin::Network::Signet));
        assert!(!config.spend_unconfirmed);
    }

    #[test]
    fn test_coin_type() {
        let signet_config = WalletConfig {
            network: bitcoin::Network::Signet,
            ..Default::default()
        };
        assert_eq!(signet_config.coin_type(), 1);

        let mainnet_config = WalletConfig {
            network: bitcoin::Network::Bitcoin,
            ..Default::default()
        };
        assert_eq!(mainnet_config.coin_type(), 0);
    }

    #[test]
    fn test_state_config_retry_defaults() {
        let state = StateConfig::default();
        assert_eq!(state.send_retry_base, Duration::from_millis(15_000));
        assert_eq!(state.max_send_attempts, 5);
    }

    #[test]
    fn test_parse_unknown_network_falls_back_to_signet() {
        assert_eq!(
            WalletConfig::parse_network("moonnet"),
            bitcoin::Network::Signet
        );
        assert_eq!(
            WalletConfig::parse_network("regtest"),
            bitcoin::Network::Regtest
        );
    }
}
