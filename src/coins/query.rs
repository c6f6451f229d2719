//! Immutable coin query builder
//!
//! Every modifier returns a new query. Filters are applied conjunctively and
//! an `only_*` flag overrides its `include_*` counterpart. The default query
//! yields unspent, available, unfrozen coins of any color.

use std::collections::BTreeMap;

use crate::coins::CoinRecord;
use crate::color::{ColorDefinition, ColorId, ColorValue};
use crate::ledger::wallet_clock;
use crate::state::WalletState;

#[derive(Clone, Debug, Default)]
pub struct CoinQuery {
    only_colored_as: Option<Vec<ColorId>>,
    only_addresses: Option<Vec<String>>,
    include_spent: bool,
    only_spent: bool,
    include_unconfirmed: bool,
    only_unconfirmed: bool,
    include_frozen: bool,
    only_frozen: bool,
}

impl CoinQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only_colored_as(&self, colors: &[ColorDefinition]) -> Self {
        Self {
            only_colored_as: Some(colors.iter().map(|c| c.id()).collect()),
            ..self.clone()
        }
    }

    pub fn only_addresses(&self, addresses: &[String]) -> Self {
        Self {
            only_addresses: Some(addresses.to_vec()),
            ..self.clone()
        }
    }

    pub fn include_spent(&self) -> Self {
        Self {
            include_spent: true,
            ..self.clone()
        }
    }

    pub fn only_spent(&self) -> Self {
        Self {
            only_spent: true,
            ..self.clone()
        }
    }

    pub fn include_unconfirmed(&self) -> Self {
        Self {
            include_unconfirmed: true,
            ..self.clone()
        }
    }

    pub fn only_unconfirmed(&self) -> Self {
        Self {
            only_unconfirmed: true,
            ..self.clone()
        }
    }

    pub fn include_frozen(&self) -> Self {
        Self {
            include_frozen: true,
            ..self.clone()
        }
    }

    pub fn only_frozen(&self) -> Self {
        Self {
            only_frozen: true,
            ..self.clone()
        }
    }

    /// Run the query against a wallet state
    pub fn get_coins(&self, state: &WalletState) -> CoinList {
        let tracker = state.coins();
        let ledger = state.ledger();
        let chain_height = state.chain_height();
        let now = wallet_clock();

        let coins = tracker
            .get_coins(self.only_addresses.as_deref())
            .into_iter()
            .filter(|coin| {
                let outpoint = coin.outpoint();
                if !tracker.is_coin_valid(&outpoint, ledger) {
                    return false;
                }
                if let Some(colors) = &self.only_colored_as {
                    if !colors.contains(&coin.color_value.color_id) {
                        return false;
                    }
                }

                let spent = tracker.is_coin_spent(&outpoint);
                let keep_spent = if self.only_spent {
                    spent
                } else {
                    self.include_spent || !spent
                };

                let unconfirmed = !tracker.is_coin_available(&outpoint, ledger);
                let keep_unconfirmed = if self.only_unconfirmed {
                    unconfirmed
                } else {
                    self.include_unconfirmed || !unconfirmed
                };

                let frozen = tracker.is_coin_frozen(&outpoint, chain_height, now);
                let keep_frozen = if self.only_frozen {
                    frozen
                } else {
                    self.include_frozen || !frozen
                };

                keep_spent && keep_unconfirmed && keep_frozen
            })
            .collect();

        CoinList { coins }
    }
}

/// Result of a [`CoinQuery`], in insertion order
#[derive(Clone, Debug, Default)]
pub struct CoinList {
    coins: Vec<CoinRecord>,
}

impl CoinList {
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoinRecord> {
        self.coins.iter()
    }

    pub fn into_inner(self) -> Vec<CoinRecord> {
        self.coins
    }

    /// Sum of color values, one entry per color present
    pub fn total_value(&self) -> Vec<ColorValue> {
        let mut totals: BTreeMap<ColorId, u64> = BTreeMap::new();
        for coin in &self.coins {
            *totals.entry(coin.color_value.color_id).or_default() += coin.color_value.value;
        }
        totals
            .into_iter()
            .map(|(color_id, value)| ColorValue { color_id, value })
            .collect()
    }
}
