//! The boundary to the target chain.
//!
//! The engine only ever talks to a [`Network`]: sign a transaction, broadcast it, wait for it
//! to reach a confirmation depth. Signing happens before anything is sent so the hash is known
//! up front and a broadcast can be repeated without creating a second transaction.
//! [`JsonRpcNetwork`] drives a real node, [`SimulatedNetwork`] is an in-process chain used by
//! tests and dry runs.

mod rpc;
mod signing;
mod simulated;

pub use rpc::{JsonRpcNetwork, RpcSettings};
pub use signing::PrivateKey;
pub use simulated::{SIMULATED_CHAIN_ID, SimulatedNetwork};

use std::future::Future;

use alloy_core::primitives::{Address, Bytes, ChainId, TxHash, U256};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// A transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
}

impl TransactionRequest {
    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// A transaction signed with a fixed nonce.
///
/// Broadcasting it again is harmless: the network either ignores the duplicate or reports
/// the nonce as used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub request: TransactionRequest,
    pub nonce: u64,
    pub hash: TxHash,
    pub raw: Bytes,
}

/// Outcome of a transaction that reached the requested depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// A contract was created at the given address.
    Created(Address),
    /// A call succeeded.
    Executed,
    /// Included, but execution reverted.
    Reverted(String),
}

/// A chain the engine can deploy to.
pub trait Network: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<ChainId, NetworkError>> + Send;

    /// Accounts this network can sign for, in order.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Address>, NetworkError>> + Send;

    /// Sign `tx` with the next nonce of its sender. Nothing is sent.
    fn sign(
        &self,
        tx: &TransactionRequest,
    ) -> impl Future<Output = Result<SignedTransaction, NetworkError>> + Send;

    /// Send a signed transaction. Sending one the network already knows returns its hash.
    fn broadcast(
        &self,
        tx: &SignedTransaction,
    ) -> impl Future<Output = Result<TxHash, NetworkError>> + Send;

    /// Sign and broadcast in one go.
    fn submit(
        &self,
        tx: &TransactionRequest,
    ) -> impl Future<Output = Result<TxHash, NetworkError>> + Send {
        async move {
            let signed = self.sign(tx).await?;
            self.broadcast(&signed).await
        }
    }

    /// Block until `tx_hash` is included and `depth` blocks deep (inclusion counts as one).
    ///
    /// Fails with [`NetworkError::Dropped`] once the network no longer knows the transaction.
    fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        depth: u64,
    ) -> impl Future<Output = Result<Receipt, NetworkError>> + Send;
}
