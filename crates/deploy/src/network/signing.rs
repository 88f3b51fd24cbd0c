//! Local signing with configured private keys.
//!
//! Transactions are encoded as legacy EIP-155 transactions so that every node accepts them
//! through `eth_sendRawTransaction`.

use std::{fmt, str::FromStr};

use alloy_core::{
    primitives::{Address, Bytes, ChainId, TxHash, U256, keccak256},
    rlp::{Encodable, Header},
};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use serde::Deserialize;

use super::TransactionRequest;
use crate::error::NetworkError;

/// A hex-encoded private key read from the configuration.
///
/// Never serialized and redacted from debug output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl From<&str> for PrivateKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl PrivateKey {
    pub fn signer(&self) -> anyhow::Result<PrivateKeySigner> {
        // The parse error is dropped so the key never ends up in a message.
        PrivateKeySigner::from_str(self.0.trim())
            .ok()
            .context("Invalid private key: expected 32 hex-encoded bytes")
    }
}

/// Fields fixed before a transaction is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyFields {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub chain_id: ChainId,
}

/// Sign `tx` as a legacy EIP-155 transaction, returning its hash and raw encoding.
pub fn sign_legacy(
    signer: &PrivateKeySigner,
    tx: &TransactionRequest,
    fields: &LegacyFields,
) -> Result<(TxHash, Bytes), NetworkError> {
    let sighash = keccak256(legacy_rlp(tx, fields, None));
    let signature = signer
        .sign_hash_sync(&sighash)
        .map_err(|e| NetworkError::Rejected(format!("failed to sign for {}: {}", tx.from, e)))?;

    let v = fields.chain_id * 2 + 35 + u64::from(signature.v());
    let raw = legacy_rlp(tx, fields, Some((v, signature.r(), signature.s())));
    Ok((keccak256(&raw), raw.into()))
}

/// RLP list of the transaction. Without a signature this is the EIP-155 signing preimage,
/// which carries `chain_id, 0, 0` in place of `v, r, s`.
fn legacy_rlp(
    tx: &TransactionRequest,
    fields: &LegacyFields,
    signature: Option<(u64, U256, U256)>,
) -> Vec<u8> {
    let creation = Bytes::new();
    let to: &dyn Encodable = match &tx.to {
        Some(to) => to,
        None => &creation,
    };
    let (v, r, s) = signature.unwrap_or((fields.chain_id, U256::ZERO, U256::ZERO));

    let items: [&dyn Encodable; 9] = [
        &fields.nonce,
        &fields.gas_price,
        &fields.gas_limit,
        to,
        &tx.value,
        &tx.data,
        &v,
        &r,
        &s,
    ];
    let payload_length = items.iter().map(|item| item.length()).sum();

    let mut out = Vec::with_capacity(payload_length + 3);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for item in items {
        item.encode(&mut out);
    }
    out
}

/// Address of every signer, in configuration order.
pub fn addresses(signers: &[PrivateKeySigner]) -> Vec<Address> {
    signers.iter().map(PrivateKeySigner::address).collect()
}
