//! Deterministic in-process chain.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, ChainId, TxHash, keccak256};

use super::{Network, Receipt, SignedTransaction, TransactionRequest};
use crate::error::NetworkError;

/// Chain id reported by default, matching a local development node.
pub const SIMULATED_CHAIN_ID: ChainId = 31337;

type RevertRule = Box<dyn Fn(&TransactionRequest) -> Option<String> + Send>;

struct MinedTransaction {
    block: u64,
    receipt: Receipt,
}

#[derive(Default)]
struct ChainState {
    head: u64,
    nonces: HashMap<Address, u64>,
    mined: HashMap<TxHash, MinedTransaction>,
    submissions: Vec<TransactionRequest>,
    reverts: Vec<RevertRule>,
    failing_submits: usize,
    lost_acknowledgements: usize,
    dropped: usize,
    failing_waits: usize,
}

/// A [`Network`] that mines every transaction into its own block immediately.
///
/// Contract addresses follow the usual `sender + nonce` derivation, so they are reproducible.
/// Tests script failures with [`revert_when`](Self::revert_when),
/// [`fail_submissions`](Self::fail_submissions), [`lose_acknowledgements`](Self::lose_acknowledgements),
/// [`drop_submissions`](Self::drop_submissions) and [`fail_waits`](Self::fail_waits).
pub struct SimulatedNetwork {
    chain_id: ChainId,
    accounts: Vec<Address>,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for SimulatedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNetwork")
            .field("chain_id", &self.chain_id)
            .field("accounts", &self.accounts)
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new(SIMULATED_CHAIN_ID, 4)
    }
}

impl SimulatedNetwork {
    /// A chain with `accounts` funded signers `0x1111…`, `0x2222…`, …
    pub fn new(chain_id: ChainId, accounts: u8) -> Self {
        Self {
            chain_id,
            accounts: (1..=accounts)
                .map(|i| Address::repeat_byte(i.wrapping_mul(0x11)))
                .collect(),
            state: Mutex::new(ChainState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Revert every transaction for which `rule` returns a reason.
    pub fn revert_when(
        &self,
        rule: impl Fn(&TransactionRequest) -> Option<String> + Send + 'static,
    ) {
        self.state().reverts.push(Box::new(rule));
    }

    pub fn clear_reverts(&self) {
        self.state().reverts.clear();
    }

    /// Make the next `count` broadcasts fail with a transient error before reaching the chain.
    pub fn fail_submissions(&self, count: usize) {
        self.state().failing_submits = count;
    }

    /// Answer the next `count` broadcasts with a transient error after mining them.
    pub fn lose_acknowledgements(&self, count: usize) {
        self.state().lost_acknowledgements = count;
    }

    /// Accept the next `count` broadcasts and then forget them without mining.
    pub fn drop_submissions(&self, count: usize) {
        self.state().dropped = count;
    }

    /// Make the next `count` confirmation waits fail with a transient error.
    pub fn fail_waits(&self, count: usize) {
        self.state().failing_waits = count;
    }

    /// Every transaction mined so far, in order.
    pub fn submissions(&self) -> Vec<TransactionRequest> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Address the next creation by `sender` will get.
    pub fn next_contract_address(&self, sender: Address) -> Address {
        let nonce = self.state().nonces.get(&sender).copied().unwrap_or_default();
        sender.create(nonce)
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }
}

impl Network for SimulatedNetwork {
    async fn chain_id(&self) -> Result<ChainId, NetworkError> {
        Ok(self.chain_id)
    }

    async fn accounts(&self) -> Result<Vec<Address>, NetworkError> {
        Ok(self.accounts.clone())
    }

    async fn sign(&self, tx: &TransactionRequest) -> Result<SignedTransaction, NetworkError> {
        if !self.accounts.contains(&tx.from) {
            return Err(NetworkError::Rejected(format!("unknown account {}", tx.from)));
        }
        let nonce = self.state().nonces.get(&tx.from).copied().unwrap_or_default();

        let mut raw = Vec::with_capacity(96 + tx.data.len());
        raw.extend_from_slice(&self.chain_id.to_be_bytes());
        raw.extend_from_slice(tx.from.as_slice());
        raw.extend_from_slice(&nonce.to_be_bytes());
        raw.extend_from_slice(tx.to.unwrap_or_default().as_slice());
        raw.extend_from_slice(&tx.value.to_be_bytes::<32>());
        raw.extend_from_slice(&tx.data);

        Ok(SignedTransaction {
            request: tx.clone(),
            nonce,
            hash: keccak256(&raw),
            raw: raw.into(),
        })
    }

    async fn broadcast(&self, signed: &SignedTransaction) -> Result<TxHash, NetworkError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let tx = &signed.request;

        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(NetworkError::Transient("simulated submission timeout".into()));
        }
        if state.mined.contains_key(&signed.hash) {
            tracing::trace!(tx_hash = %signed.hash, "Simulated transaction already known");
        } else {
            let nonce = state.nonces.entry(tx.from).or_default();
            if *nonce != signed.nonce {
                return Err(NetworkError::Rejected(format!(
                    "nonce {} of {} is not the next one ({})",
                    signed.nonce, tx.from, nonce
                )));
            }
            if state.dropped > 0 {
                state.dropped -= 1;
                tracing::trace!(tx_hash = %signed.hash, "Simulated transaction dropped");
                return Ok(signed.hash);
            }
            *nonce += 1;

            let receipt = match state.reverts.iter().find_map(|rule| rule(tx)) {
                Some(reason) => Receipt::Reverted(reason),
                None if tx.is_creation() => Receipt::Created(tx.from.create(signed.nonce)),
                None => Receipt::Executed,
            };

            state.head += 1;
            let block = state.head;
            state.mined.insert(signed.hash, MinedTransaction { block, receipt });
            state.submissions.push(tx.clone());
            tracing::trace!(tx_hash = %signed.hash, block, "Simulated transaction mined");
        }

        if state.lost_acknowledgements > 0 {
            state.lost_acknowledgements -= 1;
            return Err(NetworkError::Transient("simulated connection reset".into()));
        }
        Ok(signed.hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        depth: u64,
    ) -> Result<Receipt, NetworkError> {
        let mut state = self.state();

        if state.failing_waits > 0 {
            state.failing_waits -= 1;
            return Err(NetworkError::Transient("simulated receipt timeout".into()));
        }

        let (block, receipt) = match state.mined.get(&tx_hash) {
            Some(mined) => (mined.block, mined.receipt.clone()),
            None => return Err(NetworkError::Dropped(tx_hash)),
        };

        // Mine empty blocks until the transaction is deep enough.
        let target = block + depth.saturating_sub(1);
        state.head = state.head.max(target);

        Ok(receipt)
    }
}
