//! Bitcoin JSON-RPC client.
//!
//! Exposes exactly the seven node methods the driver needs. The spec
//! describes these as taking a completion continuation; in async Rust that
//! collapses to a plain `async fn` per method (see SPEC_FULL.md §4.2), so the
//! trait below is the entire "RPC client" component.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;

/// Result of `fundrawtransaction`.
#[derive(Clone, Debug, Deserialize)]
pub struct FundRawTransactionResult {
    pub hex: String,
    pub changepos: i32,
    pub fee: f64,
}

/// Result of `signrawtransaction`.
#[derive(Clone, Debug, Deserialize)]
pub struct SignRawTransactionResult {
    pub hex: String,
    pub complete: bool,
}

/// Result of `gettxout`, when the output is still unspent.
#[derive(Clone, Debug, Deserialize)]
pub struct TxOutResult {
    pub value: f64,
    pub confirmations: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyResult,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptPubKeyResult {
    pub hex: String,
}

/// One unspent-transaction-output input reference for `createrawtransaction`.
#[derive(Clone, Debug, Serialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "Sequence")]
    pub sequence: u32,
}

/// The seven Bitcoin node operations the driver issues.
///
/// At most one call is ever outstanding per driver instance (see SPEC_FULL.md
/// §5); implementations do not need internal request pipelining.
#[async_trait]
pub trait BitcoinRpcClient: Send + Sync {
    async fn get_raw_change_address(&self) -> Result<String, RpcError>;

    async fn fund_raw_transaction(
        &self,
        hex_tx: &str,
    ) -> Result<FundRawTransactionResult, RpcError>;

    async fn sign_raw_transaction(
        &self,
        hex_tx: &str,
    ) -> Result<SignRawTransactionResult, RpcError>;

    /// Returns `Some(txid)` on success, `None` if the node rejected the
    /// broadcast (the wire-level empty-string result).
    async fn send_raw_transaction(&self, hex_tx: &str) -> Result<Option<String>, RpcError>;

    async fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &serde_json::Map<String, Value>,
        locktime: Option<u64>,
    ) -> Result<String, RpcError>;

    async fn dump_priv_key(&self, address: &str) -> Result<String, RpcError>;

    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOutResult>, RpcError>;
}

/// JSON-RPC 1.0 envelope, matching the wire shape Bitcoin Core expects.
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    message: String,
}

/// HTTP JSON-RPC client talking directly to a `bitcoind`-compatible node.
pub struct HttpBitcoinRpcClient {
    url: String,
    user: Option<String>,
    password: Option<String>,
    http: reqwest::Client,
}

impl HttpBitcoinRpcClient {
    pub fn new(url: impl Into<String>, user: Option<String>, password: Option<String>) -> Self {
        Self {
            url: url.into(),
            user,
            password,
            http: reqwest::Client::new(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: "beam-btc-swap",
            method,
            params,
        };

        let mut req = self.http.post(&self.url).json(&request);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_ref());
        }

        #[cfg(feature = "metrics")]
        let timer = crate::metrics::start_rpc_timer(method);

        let response = req
            .send()
            .await
            .map_err(|source| RpcError::Transport { method, source })?;

        let parsed: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|source| RpcError::Transport { method, source })?;

        #[cfg(feature = "metrics")]
        timer.observe_duration();

        match (parsed.result, parsed.error) {
            (Some(result), None) => Ok(result),
            (_, Some(error)) => Err(RpcError::NodeError {
                method,
                message: error.message,
            }),
            (None, None) => Err(RpcError::MalformedReply {
                method,
                reason: "response carried neither result nor error".to_string(),
            }),
        }
    }

    /// Like `call`, but a bare `{"result": null, "error": null}` reply is a
    /// legitimate answer (used only by `gettxout`, where null means the
    /// output is spent or unknown) rather than a malformed response.
    async fn call_optional<T: for<'de> Deserialize<'de>>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: "beam-btc-swap",
            method,
            params,
        };

        let mut req = self.http.post(&self.url).json(&request);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_ref());
        }

        #[cfg(feature = "metrics")]
        let timer = crate::metrics::start_rpc_timer(method);

        let response = req
            .send()
            .await
            .map_err(|source| RpcError::Transport { method, source })?;

        let parsed: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|source| RpcError::Transport { method, source })?;

        #[cfg(feature = "metrics")]
        timer.observe_duration();

        match parsed.error {
            Some(error) => Err(RpcError::NodeError {
                method,
                message: error.message,
            }),
            None => Ok(parsed.result),
        }
    }
}

#[async_trait]
impl BitcoinRpcClient for HttpBitcoinRpcClient {
    async fn get_raw_change_address(&self) -> Result<String, RpcError> {
        self.call("getrawchangeaddress", json!([])).await
    }

    async fn fund_raw_transaction(
        &self,
        hex_tx: &str,
    ) -> Result<FundRawTransactionResult, RpcError> {
        self.call("fundrawtransaction", json!([hex_tx])).await
    }

    async fn sign_raw_transaction(
        &self,
        hex_tx: &str,
    ) -> Result<SignRawTransactionResult, RpcError> {
        self.call("signrawtransaction", json!([hex_tx])).await
    }

    async fn send_raw_transaction(&self, hex_tx: &str) -> Result<Option<String>, RpcError> {
        let txid: String = self.call("sendrawtransaction", json!([hex_tx])).await?;
        Ok(if txid.is_empty() { None } else { Some(txid) })
    }

    async fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &serde_json::Map<String, Value>,
        locktime: Option<u64>,
    ) -> Result<String, RpcError> {
        let mut params = vec![json!(inputs), Value::Object(outputs.clone())];
        if let Some(locktime) = locktime {
            params.push(json!(locktime.to_string()));
        }
        self.call("createrawtransaction", Value::Array(params))
            .await
    }

    async fn dump_priv_key(&self, address: &str) -> Result<String, RpcError> {
        self.call("dumpprivkey", json!([address])).await
    }

    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOutResult>, RpcError> {
        self.call_optional("gettxout", json!([txid, vout])).await
    }
}
