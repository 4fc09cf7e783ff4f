//! JSON-RPC access to an EVM node.
//!
//! [`RpcClient`] is the seam the ingestion pipeline fetches through; the
//! HTTP implementation is [`JsonRpcClient`]. Raw JSON is returned untouched
//! and canonicalized later by [`crate::normalize`].

use std::borrow::Cow;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::transports::{RpcError, TransportError, TransportErrorKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Failure of a single node request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP status {status} from {endpoint}")]
    Http { endpoint: String, status: u16 },
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl FetchError {
    /// True when retrying cannot succeed (the node reports the object does not exist).
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }

    /// True when the node signalled rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status == 429,
            FetchError::Rpc { code, message } => {
                *code == -32005 || *code == 429 || message.to_ascii_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }
}

/// Read access to a node, one method per JSON-RPC call the pipeline needs.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Endpoint label used in logs.
    fn endpoint(&self) -> &str;

    /// `eth_getTransactionByHash`. A `null` result maps to [`FetchError::NotFound`].
    async fn get_transaction(&self, hash: &str) -> Result<Value, FetchError>;

    /// `eth_getTransactionReceipt`. A `null` result maps to [`FetchError::NotFound`].
    async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, FetchError>;

    /// `eth_getBlockByNumber` without full transactions.
    async fn get_block(&self, number: u64) -> Result<Value, FetchError>;
}

type ProviderType = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// HTTP JSON-RPC client backed by an alloy provider.
///
/// Calls go through `raw_request` so the node's JSON reaches
/// [`crate::normalize`] without being reshaped by alloy's typed responses.
/// Per-call timeouts are enforced by the caller.
pub struct JsonRpcClient {
    endpoint: String,
    provider: ProviderType,
}

impl JsonRpcClient {
    /// Builds a client for `endpoint`. No request is made.
    ///
    /// # Errors
    /// Returns [`FetchError::Transport`] if the endpoint is not a valid URL.
    pub fn new(endpoint: &str) -> Result<Self, FetchError> {
        let url: reqwest::Url = endpoint.parse().map_err(|err| FetchError::Transport {
            endpoint: endpoint.to_string(),
            message: format!("invalid RPC URL: {err}"),
        })?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            provider: ProviderBuilder::new().on_http(url),
        })
    }

    #[tracing::instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    async fn call(&self, method: &'static str, params: Value) -> Result<Value, FetchError> {
        self.provider
            .raw_request::<Value, Value>(Cow::Borrowed(method), params)
            .await
            .map_err(|err| self.fetch_error(method, err))
    }

    fn fetch_error(&self, method: &str, err: TransportError) -> FetchError {
        match err {
            RpcError::ErrorResp(payload) => FetchError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            RpcError::Transport(TransportErrorKind::HttpError(http)) => FetchError::Http {
                endpoint: self.endpoint.clone(),
                status: http.status,
            },
            RpcError::DeserError { err, .. } => FetchError::Decode(format!("{method}: {err}")),
            other => FetchError::Transport {
                endpoint: self.endpoint.clone(),
                message: other.to_string(),
            },
        }
    }
}

fn non_null(value: Value, kind: &'static str, id: &str) -> Result<Value, FetchError> {
    if value.is_null() {
        Err(FetchError::NotFound {
            kind,
            id: id.to_string(),
        })
    } else {
        Ok(value)
    }
}

#[async_trait]
impl RpcClient for JsonRpcClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_transaction(&self, hash: &str) -> Result<Value, FetchError> {
        let result = self.call("eth_getTransactionByHash", json!([hash])).await?;
        non_null(result, "transaction", hash)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, FetchError> {
        let result = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        non_null(result, "receipt", hash)
    }

    async fn get_block(&self, number: u64) -> Result<Value, FetchError> {
        let tag = format!("0x{number:x}");
        let result = self.call("eth_getBlockByNumber", json!([tag, false])).await?;
        non_null(result, "block", &number.to_string())
    }
}
