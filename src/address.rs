//! Address management
//!
//! The core only needs four things from key management: the addresses it
//! already derived per color, a fresh address, the private key behind an
//! address, and a way to tell whether a seed is the wallet's seed.
//! [`HdAddressManager`] provides them with BIP32 derivation over P2WPKH
//! addresses, one account per color definition:
//! `m/84'/<coin type>'/<color id>'/0/<index>`.

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, PrivateKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::RwLock;

use crate::color::{ColorDefinition, ColorId};
use crate::error::WalletError;
use crate::Result;

pub trait AddressManager: Send + Sync {
    /// Addresses derived so far for `color`, oldest first
    fn get_all_addresses(&self, color: &ColorDefinition) -> Vec<Address>;

    /// Every address derived so far, for all colors
    fn get_wallet_addresses(&self) -> Vec<Address>;

    fn get_new_address(&self, color: &ColorDefinition, seed: &[u8]) -> Result<Address>;

    /// `Ok(None)` when the address was not derived by this manager
    fn get_private_key_by_address(&self, address: &Address, seed: &[u8])
        -> Result<Option<PrivateKey>>;

    fn is_current_seed(&self, seed: &[u8]) -> bool;
}

/// Derived address with its derivation coordinates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub color_id: ColorId,
    pub index: u32,
    pub address: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressBook {
    /// Master key fingerprint of the seed that derived these addresses
    pub fingerprint: Option<String>,
    pub records: Vec<AddressRecord>,
}

pub struct HdAddressManager {
    network: Network,
    coin_type: u32,
    book: RwLock<AddressBook>,
}

impl HdAddressManager {
    pub fn new(network: Network) -> Self {
        Self::with_book(network, AddressBook::default())
    }

    /// Restore a manager from a previously saved address book
    pub fn with_book(network: Network, book: AddressBook) -> Self {
        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        Self {
            network,
            coin_type,
            book: RwLock::new(book),
        }
    }

    /// Seed bytes from a BIP39 mnemonic (empty passphrase)
    pub fn seed_from_mnemonic(words: &str) -> Result<Vec<u8>> {
        let mnemonic = bip39::Mnemonic::parse(words)
            .map_err(|e| WalletError::Bitcoin(format!("Invalid mnemonic: {}", e)))?;
        Ok(mnemonic.to_seed("").to_vec())
    }

    /// Snapshot of the address book for persistence
    pub fn book(&self) -> AddressBook {
        self.book
            .read()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn master(&self, seed: &[u8]) -> Result<Xpriv> {
        Xpriv::new_master(self.network, seed).map_err(|e| WalletError::Bitcoin(e.to_string()))
    }

    fn fingerprint(&self, seed: &[u8]) -> Result<Fingerprint> {
        let secp = Secp256k1::new();
        Ok(self.master(seed)?.fingerprint(&secp))
    }

    /// Derive the private key and P2WPKH address at a color's index
    fn derive(&self, seed: &[u8], color_id: ColorId, index: u32) -> Result<(PrivateKey, Address)> {
        let secp = Secp256k1::new();
        let path = DerivationPath::from_str(&format!(
            "m/84'/{}'/{}'/0/{}",
            self.coin_type, color_id, index
        ))
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        let derived = self
            .master(seed)?
            .derive_priv(&secp, &path)
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        let private_key = PrivateKey::new(derived.private_key, self.network);
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
        Ok((private_key, Address::p2wpkh(&public_key, self.network)))
    }

    /// Fail with `VerifySeedHex` unless `seed` derived the existing addresses
    fn verify_seed(&self, seed: &[u8]) -> Result<()> {
        if self.is_current_seed(seed) {
            Ok(())
        } else {
            Err(WalletError::VerifySeedHex)
        }
    }

    fn parse(&self, address: &str) -> Option<Address> {
        Address::from_str(address)
            .ok()?
            .require_network(self.network)
            .ok()
    }
}

impl AddressManager for HdAddressManager {
    fn get_all_addresses(&self, color: &ColorDefinition) -> Vec<Address> {
        let Ok(book) = self.book.read() else {
            return Vec::new();
        };
        book.records
            .iter()
            .filter(|r| r.color_id == color.id())
            .filter_map(|r| self.parse(&r.address))
            .collect()
    }

    fn get_wallet_addresses(&self) -> Vec<Address> {
        let Ok(book) = self.book.read() else {
            return Vec::new();
        };
        book.records
            .iter()
            .filter_map(|r| self.parse(&r.address))
            .collect()
    }

    fn get_new_address(&self, color: &ColorDefinition, seed: &[u8]) -> Result<Address> {
        self.verify_seed(seed)?;
        let fingerprint = self.fingerprint(seed)?;

        let mut book = self
            .book
            .write()
            .map_err(|e| WalletError::Internal(format!("address book lock poisoned: {}", e)))?;
        let index = book
            .records
            .iter()
            .filter(|r| r.color_id == color.id())
            .count() as u32;

        let (_, address) = self.derive(seed, color.id(), index)?;
        book.fingerprint = Some(fingerprint.to_string());
        book.records.push(AddressRecord {
            color_id: color.id(),
            index,
            address: address.to_string(),
        });

        log::info!(
            "Derived address {} (color {}, index {})",
            address,
            color.id(),
            index
        );
        Ok(address)
    }

    fn get_private_key_by_address(
        &self,
        address: &Address,
        seed: &[u8],
    ) -> Result<Option<PrivateKey>> {
        self.verify_seed(seed)?;
        let wanted = address.to_string();
        let record = {
            let book = self
                .book
                .read()
                .map_err(|e| WalletError::Internal(format!("address book lock poisoned: {}", e)))?;
            book.records.iter().find(|r| r.address == wanted).cloned()
        };

        match record {
            Some(r) => {
                let (key, derived) = self.derive(seed, r.color_id, r.index)?;
                if derived.to_string() != wanted {
                    return Err(WalletError::VerifySeedHex);
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// A fresh manager accepts any seed; afterwards only the seed that
    /// derived the stored addresses matches
    fn is_current_seed(&self, seed: &[u8]) -> bool {
        let stored = match self.book.read() {
            Ok(book) => book.fingerprint.clone(),
            Err(_) => return false,
        };
        match stored {
            None => true,
            Some(expected) => self
                .fingerprint(seed)
                .map(|fp| fp.to_string() == expected)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn seed() -> Vec<u8> {
        HdAddressManager::seed_from_mnemonic(MNEMONIC).unwrap()
    }

    #[test]
    fn test_addresses_are_per_color() {
        let manager = HdAddressManager::new(Network::Regtest);
        let uncolored = ColorDefinition::uncolored();

        let first = manager.get_new_address(&uncolored, &seed()).unwrap();
        let second = manager.get_new_address(&uncolored, &seed()).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.get_all_addresses(&uncolored), vec![first, second]);
        assert_eq!(manager.get_wallet_addresses().len(), 2);
    }

    #[test]
    fn test_private_key_matches_address() {
        let manager = HdAddressManager::new(Network::Regtest);
        let address = manager
            .get_new_address(&ColorDefinition::uncolored(), &seed())
            .unwrap();

        let key = manager
            .get_private_key_by_address(&address, &seed())
            .unwrap()
            .unwrap();
        let secp = Secp256k1::new();
        let pubkey = CompressedPublicKey::from_private_key(&secp, &key).unwrap();
        assert_eq!(Address::p2wpkh(&pubkey, Network::Regtest), address);
    }

    #[test]
    fn test_foreign_seed_rejected() {
        let manager = HdAddressManager::new(Network::Regtest);
        let address = manager
            .get_new_address(&ColorDefinition::uncolored(), &seed())
            .unwrap();

        let other = vec![7u8; 64];
        assert!(!manager.is_current_seed(&other));
        assert!(matches!(
            manager.get_private_key_by_address(&address, &other),
            Err(WalletError::VerifySeedHex)
        ));
        assert!(matches!(
            manager.get_new_address(&ColorDefinition::uncolored(), &other),
            Err(WalletError::VerifySeedHex)
        ));
    }

    #[test]
    fn test_unknown_address_has_no_key() {
        let manager = HdAddressManager::new(Network::Regtest);
        let known = manager
            .get_new_address(&ColorDefinition::uncolored(), &seed())
            .unwrap();
        let restored = HdAddressManager::with_book(Network::Regtest, AddressBook {
            fingerprint: manager.book().fingerprint,
            records: vec![],
        });
        assert!(restored
            .get_private_key_by_address(&known, &seed())
            .unwrap()
            .is_none());
    }
}
