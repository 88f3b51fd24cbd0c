//! JSON-RPC over HTTP.
//!
//! Transactions are signed locally when a private key for the sender is configured, and by
//! the node (`eth_signTransaction`) otherwise. Either way the signed bytes are sent with
//! `eth_sendRawTransaction`.

use std::time::{Duration, Instant};

use alloy_core::{
    primitives::{Address, Bytes, ChainId, TxHash, U64, U256, keccak256},
    sol_types::decode_revert_reason,
};
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{
    Network, Receipt, SignedTransaction, TransactionRequest,
    signing::{self, LegacyFields},
};
use crate::error::NetworkError;

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between receipt polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time to wait for a transaction to reach its confirmation depth.
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

/// JSON-RPC error code some nodes use for execution reverts.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Consecutive polls in which the node does not know a transaction before it counts as
/// dropped.
const DROPPED_AFTER_POLLS: u32 = 3;

/// Headroom added to gas estimates, in percent.
const GAS_LIMIT_MARGIN_PERCENT: u64 = 20;

/// Polling behaviour of [`JsonRpcNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcSettings {
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// Transport failures, HTTP 429/5xx and undecodable bodies are transient. Error objects are
/// reverts when the node says so, rejections otherwise.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, NetworkError> {
    let response = client
        .post(url.clone())
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| NetworkError::Transient(format!("{} request failed: {}", method, e)))?;

    let status = response.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(NetworkError::Transient(format!(
            "{} returned HTTP {}",
            method, status
        )));
    }

    let body: Value = response.json().await.map_err(|e| {
        NetworkError::Transient(format!("Failed to parse {} response: {}", method, e))
    })?;

    if let Some(error) = body.get("error") {
        return Err(classify_error(error));
    }

    let result = body
        .get("result")
        .cloned()
        .ok_or_else(|| NetworkError::Rejected(format!("No result in {} response", method)))?;

    serde_json::from_value(result)
        .map_err(|e| NetworkError::Rejected(format!("Failed to deserialize {} result: {}", method, e)))
}

fn classify_error(error: &Value) -> NetworkError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let code = error.get("code").and_then(Value::as_i64);

    if code == Some(EXECUTION_REVERTED_CODE) || message.to_lowercase().contains("revert") {
        let reason = error
            .get("data")
            .and_then(revert_data)
            .and_then(|data| decode_revert_reason(&data))
            .unwrap_or(message);
        return NetworkError::Revert { reason };
    }

    NetworkError::Rejected(message)
}

/// Revert payload from an error's `data`, which nodes send either as a hex string or as an
/// object with a `data` field.
fn revert_data(data: &Value) -> Option<Vec<u8>> {
    let hex_str = match data {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("data")?.as_str()?,
        _ => return None,
    };
    hex::decode(hex_str.trim_start_matches("0x")).ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<U64>,
    contract_address: Option<Address>,
    block_number: Option<U64>,
}

/// `eth_signTransaction` answers with the raw bytes, or with an object carrying them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcSignedTransaction {
    Raw(Bytes),
    Object { raw: Bytes },
}

impl RpcSignedTransaction {
    fn into_raw(self) -> Bytes {
        match self {
            Self::Raw(raw) | Self::Object { raw } => raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    from: Address,
    to: Option<Address>,
    input: Bytes,
    #[serde(default)]
    value: U256,
}

/// [`Network`] backed by a JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcNetwork {
    client: reqwest::Client,
    url: Url,
    settings: RpcSettings,
    signers: Vec<PrivateKeySigner>,
}

impl JsonRpcNetwork {
    pub fn new(url: Url, settings: RpcSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client()?,
            url,
            settings,
            signers: Vec::new(),
        })
    }

    /// Sign locally for these accounts. They also become the network's account list.
    pub fn with_signers(mut self, signers: Vec<PrivateKeySigner>) -> Self {
        self.signers = signers;
        self
    }

    fn signer(&self, address: Address) -> Option<&PrivateKeySigner> {
        self.signers.iter().find(|signer| signer.address() == address)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, NetworkError> {
        json_rpc_call(&self.client, &self.url, method, params).await
    }

    /// Poll `eth_chainId` until the node answers or `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let start = Instant::now();

        loop {
            match self.call::<U64>("eth_chainId", vec![]).await {
                Ok(_) => return Ok(()),
                Err(e) if start.elapsed() > timeout => {
                    return Err(e).with_context(|| format!("Timeout waiting for {}", self.url));
                }
                Err(e) => {
                    tracing::trace!(error = %e, url = %self.url, "Node not ready, retrying...");
                }
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn block_number(&self) -> Result<u64, NetworkError> {
        let number: U64 = self.call("eth_blockNumber", vec![]).await?;
        Ok(number.to::<u64>())
    }

    async fn transaction(&self, tx_hash: TxHash) -> Result<Option<RpcTransaction>, NetworkError> {
        self.call("eth_getTransactionByHash", vec![json!(tx_hash)]).await
    }

    /// Nonce, gas price and gas limit for `tx`.
    ///
    /// The nonce counts pending transactions, so it is the one the node expects next.
    async fn legacy_fields(&self, tx: &TransactionRequest) -> Result<LegacyFields, NetworkError> {
        let nonce: U64 = self
            .call("eth_getTransactionCount", vec![json!(tx.from), json!("pending")])
            .await?;
        let gas_price: U256 = self.call("eth_gasPrice", vec![]).await?;
        let estimate: U64 = self
            .call("eth_estimateGas", vec![call_object(tx)])
            .await?;
        let chain_id = self.chain_id().await?;

        let estimate = estimate.to::<u64>();
        Ok(LegacyFields {
            nonce: nonce.to::<u64>(),
            gas_price: gas_price.saturating_to::<u128>(),
            gas_limit: estimate.saturating_add(estimate / 100 * GAS_LIMIT_MARGIN_PERCENT),
            chain_id,
        })
    }

    /// Replay a reverted transaction with `eth_call` to recover its revert reason.
    async fn revert_reason(&self, tx_hash: TxHash, block: u64) -> String {
        const FALLBACK: &str = "execution reverted";

        let tx = match self.transaction(tx_hash).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(tx_hash = %tx_hash, error = %e, "Failed to fetch reverted transaction");
                return FALLBACK.to_string();
            }
        };
        let Some(tx) = tx else {
            return FALLBACK.to_string();
        };

        let mut call = json!({
            "from": tx.from,
            "data": tx.input,
            "value": tx.value,
        });
        if let Some(to) = tx.to {
            call["to"] = json!(to);
        }

        let replayed: Result<Bytes, NetworkError> = self
            .call("eth_call", vec![call, json!(format!("0x{:x}", block))])
            .await;
        match replayed {
            Err(NetworkError::Revert { reason }) => reason,
            Err(e) => format!("{} ({})", FALLBACK, e),
            Ok(_) => FALLBACK.to_string(),
        }
    }
}

impl Network for JsonRpcNetwork {
    async fn chain_id(&self) -> Result<ChainId, NetworkError> {
        let id: U64 = self.call("eth_chainId", vec![]).await?;
        Ok(id.to::<u64>())
    }

    async fn accounts(&self) -> Result<Vec<Address>, NetworkError> {
        if !self.signers.is_empty() {
            return Ok(signing::addresses(&self.signers));
        }
        self.call("eth_accounts", vec![]).await
    }

    async fn sign(&self, tx: &TransactionRequest) -> Result<SignedTransaction, NetworkError> {
        let fields = self.legacy_fields(tx).await?;

        let (hash, raw) = match self.signer(tx.from) {
            Some(signer) => signing::sign_legacy(signer, tx, &fields)?,
            None => {
                let mut request = call_object(tx);
                request["nonce"] = json!(U64::from(fields.nonce));
                request["gas"] = json!(U64::from(fields.gas_limit));
                request["gasPrice"] = json!(U256::from(fields.gas_price));

                let signed: RpcSignedTransaction =
                    self.call("eth_signTransaction", vec![request]).await?;
                let raw = signed.into_raw();
                (keccak256(&raw), raw)
            }
        };

        tracing::debug!(
            tx_hash = %hash,
            from = %tx.from,
            nonce = fields.nonce,
            gas_limit = fields.gas_limit,
            "Transaction signed"
        );
        Ok(SignedTransaction {
            request: tx.clone(),
            nonce: fields.nonce,
            hash,
            raw,
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<TxHash, NetworkError> {
        let sent: Result<TxHash, NetworkError> = self
            .call("eth_sendRawTransaction", vec![json!(tx.raw)])
            .await;

        match sent {
            Ok(hash) => {
                if hash != tx.hash {
                    tracing::warn!(expected = %tx.hash, reported = %hash, "Node reported a different transaction hash");
                }
                tracing::debug!(tx_hash = %tx.hash, from = %tx.request.from, "Transaction sent");
                Ok(tx.hash)
            }
            Err(err) if err.is_transient() => Err(err),
            // "already known", "nonce too low": fine if it is this very transaction.
            Err(err) => match self.transaction(tx.hash).await? {
                Some(_) => {
                    tracing::debug!(tx_hash = %tx.hash, error = %err, "Transaction already known to the node");
                    Ok(tx.hash)
                }
                None => Err(err),
            },
        }
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        depth: u64,
    ) -> Result<Receipt, NetworkError> {
        let start = Instant::now();
        let mut unknown_polls = 0;

        loop {
            let receipt: Option<RpcReceipt> = self
                .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
                .await?;

            match receipt {
                Some(RpcReceipt {
                    status,
                    contract_address,
                    block_number: Some(block),
                }) => {
                    unknown_polls = 0;
                    let block = block.to::<u64>();
                    let head = self.block_number().await?;
                    let confirmations = head.saturating_sub(block) + 1;

                    if confirmations >= depth {
                        return Ok(match (status, contract_address) {
                            (Some(status), _) if status.is_zero() => {
                                Receipt::Reverted(self.revert_reason(tx_hash, block).await)
                            }
                            (_, Some(address)) => Receipt::Created(address),
                            (_, None) => Receipt::Executed,
                        });
                    }

                    tracing::trace!(tx_hash = %tx_hash, confirmations, depth, "Waiting for confirmations");
                }
                _ => {
                    if self.transaction(tx_hash).await?.is_some() {
                        unknown_polls = 0;
                        tracing::trace!(tx_hash = %tx_hash, "Transaction not yet included");
                    } else {
                        unknown_polls += 1;
                        if unknown_polls >= DROPPED_AFTER_POLLS {
                            return Err(NetworkError::Dropped(tx_hash));
                        }
                        tracing::debug!(tx_hash = %tx_hash, unknown_polls, "Transaction unknown to the node");
                    }
                }
            }

            if start.elapsed() > self.settings.confirmation_timeout {
                return Err(NetworkError::Transient(format!(
                    "transaction {} not confirmed after {}s",
                    tx_hash,
                    self.settings.confirmation_timeout.as_secs()
                )));
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// `eth_call`-style object for `tx`.
fn call_object(tx: &TransactionRequest) -> Value {
    let mut request = json!({
        "from": tx.from,
        "data": tx.data,
        "value": tx.value,
    });
    if let Some(to) = tx.to {
        request["to"] = json!(to);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, routing::post};

    type Handler = Arc<dyn Fn(&str, &[Value]) -> Result<Value, Value> + Send + Sync>;

    #[derive(Clone)]
    struct MockNode {
        handler: Handler,
        calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    }

    async fn answer(State(node): State<MockNode>, Json(request): Json<Value>) -> Json<Value> {
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].as_array().cloned().unwrap_or_default();
        node.calls.lock().unwrap().push((method.clone(), params.clone()));

        Json(match (node.handler)(&method, &params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": 1, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": 1, "error": error }),
        })
    }

    /// Serve `handler` as a JSON-RPC node on a local port.
    async fn mock_node(
        handler: impl Fn(&str, &[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    ) -> (JsonRpcNetwork, Arc<Mutex<Vec<(String, Vec<Value>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().route("/", post(answer)).with_state(MockNode {
            handler: Arc::new(handler),
            calls: calls.clone(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let settings = RpcSettings {
            poll_interval: Duration::from_millis(1),
            confirmation_timeout: Duration::from_millis(200),
        };
        (JsonRpcNetwork::new(url, settings).unwrap(), calls)
    }

    fn known_transaction() -> Value {
        json!({
            "from": Address::repeat_byte(0x11),
            "to": null,
            "input": "0x6080",
            "value": "0x0",
        })
    }

    fn signed(raw: &'static [u8]) -> SignedTransaction {
        SignedTransaction {
            request: TransactionRequest {
                from: Address::repeat_byte(0x11),
                to: None,
                data: Bytes::from_static(&[0x60, 0x80]),
                value: U256::ZERO,
            },
            nonce: 0,
            hash: keccak256(raw),
            raw: Bytes::from_static(raw),
        }
    }

    #[test]
    fn test_revert_errors_are_classified() {
        // Error(string) "Ownable: caller is not the owner"
        let data = "0x08c379a0\
            0000000000000000000000000000000000000000000000000000000000000020\
            0000000000000000000000000000000000000000000000000000000000000020\
            4f776e61626c653a2063616c6c6572206973206e6f7420746865206f776e6572";
        let err = classify_error(&json!({
            "code": 3,
            "message": "execution reverted",
            "data": data,
        }));
        match err {
            NetworkError::Revert { reason } => {
                assert!(reason.contains("Ownable: caller is not the owner"), "{reason}")
            }
            other => panic!("expected a revert, got {other:?}"),
        }
    }

    #[test]
    fn test_revert_without_data_keeps_message() {
        let err = classify_error(&json!({
            "code": -32000,
            "message": "execution reverted: paused",
        }));
        assert_eq!(
            err,
            NetworkError::Revert {
                reason: "execution reverted: paused".to_string()
            }
        );
    }

    #[test]
    fn test_other_errors_are_rejections() {
        let err = classify_error(&json!({
            "code": -32000,
            "message": "nonce too low",
        }));
        assert_eq!(err, NetworkError::Rejected("nonce too low".to_string()));
    }

    #[test]
    fn test_revert_data_shapes() {
        assert_eq!(revert_data(&json!("0x0102")), Some(vec![1, 2]));
        assert_eq!(revert_data(&json!({ "data": "0x03" })), Some(vec![3]));
        assert_eq!(revert_data(&json!(7)), None);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        let network = JsonRpcNetwork::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            RpcSettings::default(),
        )
        .unwrap();
        let err = network.chain_id().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_dropped() {
        let (network, calls) = mock_node(|method, _| match method {
            "eth_getTransactionReceipt" | "eth_getTransactionByHash" => Ok(Value::Null),
            other => Err(json!({ "code": -32601, "message": other })),
        })
        .await;

        let hash = TxHash::repeat_byte(0xab);
        assert_eq!(
            network.wait_for_confirmation(hash, 1).await,
            Err(NetworkError::Dropped(hash))
        );
        let lookups = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, _)| method == "eth_getTransactionByHash")
            .count();
        assert_eq!(lookups, DROPPED_AFTER_POLLS as usize);
    }

    #[tokio::test]
    async fn test_pending_transaction_times_out_as_transient() {
        let (network, _) = mock_node(|method, _| match method {
            "eth_getTransactionReceipt" => Ok(Value::Null),
            "eth_getTransactionByHash" => Ok(known_transaction()),
            other => Err(json!({ "code": -32601, "message": other })),
        })
        .await;

        let err = network
            .wait_for_confirmation(TxHash::repeat_byte(0xab), 1)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_rebroadcast_of_a_known_transaction_succeeds() {
        let (network, _) = mock_node(|method, _| match method {
            "eth_sendRawTransaction" => Err(json!({ "code": -32000, "message": "already known" })),
            "eth_getTransactionByHash" => Ok(known_transaction()),
            other => Err(json!({ "code": -32601, "message": other })),
        })
        .await;

        let tx = signed(&[0xf8, 0x01]);
        assert_eq!(network.broadcast(&tx).await.unwrap(), tx.hash);
    }

    #[tokio::test]
    async fn test_rejected_unknown_broadcast_is_an_error() {
        let (network, _) = mock_node(|method, _| match method {
            "eth_sendRawTransaction" => {
                Err(json!({ "code": -32000, "message": "insufficient funds" }))
            }
            "eth_getTransactionByHash" => Ok(Value::Null),
            other => Err(json!({ "code": -32601, "message": other })),
        })
        .await;

        assert_eq!(
            network.broadcast(&signed(&[0xf8, 0x02])).await,
            Err(NetworkError::Rejected("insufficient funds".into()))
        );
    }

    #[tokio::test]
    async fn test_local_signer_pins_the_pending_nonce() {
        let (network, calls) = mock_node(|method, params| match method {
            "eth_getTransactionCount" => {
                assert_eq!(params[1], json!("pending"));
                Ok(json!("0x7"))
            }
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            "eth_estimateGas" => Ok(json!("0x5208")),
            "eth_chainId" => Ok(json!("0x7a69")),
            "eth_sendRawTransaction" => Ok(json!(keccak256(
                hex::decode(params[0].as_str().unwrap().trim_start_matches("0x")).unwrap()
            ))),
            other => Err(json!({ "code": -32601, "message": other })),
        })
        .await;

        let signer = signing::PrivateKey::from(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
        )
        .signer()
        .unwrap();
        let from = signer.address();
        let network = network.with_signers(vec![signer]);
        assert_eq!(network.accounts().await.unwrap(), vec![from]);

        let request = TransactionRequest {
            from,
            to: None,
            data: Bytes::from_static(&[0x60, 0x80]),
            value: U256::ZERO,
        };
        let first = network.sign(&request).await.unwrap();
        let second = network.sign(&request).await.unwrap();
        assert_eq!(first.nonce, 7);
        assert_eq!(first, second, "signing is deterministic for a pinned nonce");
        assert_eq!(first.hash, keccak256(&first.raw));

        assert_eq!(network.broadcast(&first).await.unwrap(), first.hash);
        assert_eq!(network.broadcast(&first).await.unwrap(), first.hash);

        let methods: Vec<String> = calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
        assert!(!methods.iter().any(|m| m == "eth_accounts" || m == "eth_sendTransaction"));
        assert_eq!(methods.iter().filter(|m| *m == "eth_sendRawTransaction").count(), 2);
    }
}
