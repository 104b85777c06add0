//! # Transaction Resolver
//!
//! Turns a transaction signature into the full `getTransaction` payload. One request
//! per signature, no retries: a failed lookup drops the event.

use async_trait::async_trait;
use log::{debug, error};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("RPC request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("RPC response is not a JSON object")]
    MalformedResponse,
}

/// Source of resolved transactions.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// `Ok(None)` when the node has no record for `signature`.
    async fn try_resolve(&self, signature: &str) -> Result<Option<Value>, ResolveError>;

    /// Never fails: errors are logged and reported as `None`.
    async fn resolve(&self, signature: &str) -> Option<Value> {
        match self.try_resolve(signature).await {
            Ok(tx) => tx,
            Err(e) => {
                error!("❌ [Resolver] Error fetching transaction details for {}: {}", signature, e);
                None
            }
        }
    }
}

/// JSON-RPC `getTransaction` client.
pub struct RpcTransactionResolver {
    client: reqwest::Client,
    rpc_url: String,
    commitment: String,
}

impl RpcTransactionResolver {
    pub fn new(rpc_url: String, commitment: String, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rpc_url,
            commitment,
        })
    }
}

#[async_trait]
impl TransactionSource for RpcTransactionResolver {
    async fn try_resolve(&self, signature: &str) -> Result<Option<Value>, ResolveError> {
        let payload = get_transaction_request(signature, &self.commitment);
        debug!("[Resolver] getTransaction {}", signature);

        let body: Value = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_rpc_response(body)
    }
}

pub fn get_transaction_request(signature: &str, commitment: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getTransaction",
        "params": [
            signature,
            {
                "maxSupportedTransactionVersion": 0,
                "commitment": commitment
            }
        ]
    })
}

/// Extracts `result` from a JSON-RPC envelope. A missing or null result is `None`.
pub fn parse_rpc_response(body: Value) -> Result<Option<Value>, ResolveError> {
    let Value::Object(mut envelope) = body else {
        return Err(ResolveError::MalformedResponse);
    };

    if let Some(err) = envelope.get("error") {
        return Err(ResolveError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    Ok(envelope.remove("result").filter(|r| !r.is_null()))
}
