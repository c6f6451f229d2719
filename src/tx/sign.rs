use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, PublicKey, TxOut};
use std::collections::BTreeSet;

use super::raw::RawTx;
use super::{TransformEnv, TxStage};
use crate::error::WalletError;
use crate::Result;

/// Previous output spent by `input_index`, from the ledger or the backend
async fn previous_output(raw: &RawTx, input_index: usize, env: &TransformEnv<'_>) -> Result<TxOut> {
    let prev = raw.tx().input[input_index].previous_output;
    let prev_tx = match env.state.ledger().get_tx(&prev.txid) {
        Some(tx) => tx.clone(),
        None => env.backend.get_tx(&prev.txid).await?,
    };
    prev_tx
        .output
        .get(prev.vout as usize)
        .cloned()
        .ok_or_else(|| WalletError::NotFound(format!("output {}", prev)))
}

/// Sign every unsigned P2WPKH input whose key the address manager can derive
///
/// Returns `Signed` when all inputs end up signed, `PartiallySigned` otherwise.
pub async fn sign_raw_tx(mut raw: RawTx, env: &TransformEnv<'_>) -> Result<TxStage> {
    let seed = env
        .seed
        .ok_or_else(|| WalletError::NotFound("seed for signing".to_string()))?;
    if !env.addresses.is_current_seed(seed) {
        return Err(WalletError::VerifySeedHex);
    }

    let secp = Secp256k1::new();
    let network = env.state.context().network;
    let indices: BTreeSet<usize> = match env.sign_inputs {
        Some(subset) => subset.iter().copied().collect(),
        None => (0..raw.tx().input.len()).collect(),
    };

    let mut signatures = Vec::new();
    {
        let unsigned = raw.tx().clone();
        let mut sighash_cache = SighashCache::new(&unsigned);

        for input_index in indices {
            if input_index >= unsigned.input.len() || raw.is_input_signed(input_index) {
                continue;
            }
            let prevout = previous_output(&raw, input_index, env).await?;
            if !prevout.script_pubkey.is_p2wpkh() {
                log::debug!("Input {} is not P2WPKH, leaving unsigned", input_index);
                continue;
            }
            let address = Address::from_script(&prevout.script_pubkey, network)
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            let Some(private_key) = env.addresses.get_private_key_by_address(&address, seed)? else {
                log::debug!("No key for {} (input {})", address, input_index);
                continue;
            };

            let sighash = sighash_cache
                .p2wpkh_signature_hash(
                    input_index,
                    &prevout.script_pubkey,
                    prevout.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, &private_key.inner);

            let mut sig_with_hashtype = signature.serialize_der().to_vec();
            sig_with_hashtype.push(EcdsaSighashType::All.to_u32() as u8);

            let public_key = PublicKey::from_private_key(&secp, &private_key);
            signatures.push((input_index, sig_with_hashtype, public_key.to_bytes()));
        }
    }

    let tx = raw.tx_mut();
    for (input_index, sig, pubkey) in signatures {
        tx.input[input_index].witness.push(sig);
        tx.input[input_index].witness.push(pubkey);
    }

    if raw.is_fully_signed() {
        log::info!("Signed transaction {}", raw.txid());
        Ok(TxStage::Signed(raw))
    } else {
        let signed = (0..raw.tx().input.len())
            .filter(|i| raw.is_input_signed(*i))
            .count();
        log::warn!(
            "Transaction {} partially signed ({}/{} inputs)",
            raw.txid(),
            signed,
            raw.tx().input.len()
        );
        Ok(TxStage::PartiallySigned(raw))
    }
}
