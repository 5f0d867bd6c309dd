//! JSON-RPC client for Ethereum nodes
//!
//! Builds the two requests the block fetcher needs, sends them through a
//! pluggable [`Transport`] and turns the replies into typed values or
//! [`FetchError`]s.

use crate::error::FetchError;
use crate::types::{parse_hex_u64, BlockLike};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on how much of a response body is quoted in error messages.
pub const MAX_DIAGNOSTIC_BODY: usize = 1024;

/// Request body for `eth_blockNumber`.
pub const BLOCK_NUMBER_REQUEST: &str =
    r#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#;

/// Request body for `eth_getBlockByNumber` at `height`.
pub fn block_by_number_request(height: u64, full_tx: bool) -> String {
    format!(
        r#"{{"jsonrpc":"2.0","method":"eth_getBlockByNumber","params":["0x{:x}", {}],"id":1}}"#,
        height, full_tx
    )
}

/// Executes a single JSON-RPC HTTP exchange.
///
/// Implement this to add authentication headers, proxies or to replay
/// canned responses in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` to `url` and return the raw response body.
    async fn post(&self, url: &str, body: String) -> Result<Vec<u8>, FetchError>;
}

/// Upper bound on a single JSON-RPC exchange over HTTP.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Create a transport with no extra headers and [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a transport whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            headers: HeaderMap::new(),
        }
    }

    /// Send `name: value` with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, FetchError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::InvalidHeader(format!("invalid name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::InvalidHeader(format!("invalid value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

impl HttpTransport {
    fn request(&self, url: &str, body: String) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "*/*")
            .headers(self.headers.clone())
            .body(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: String) -> Result<Vec<u8>, FetchError> {
        let response = self
            .request(url, body)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to read response body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcErrorEnvelope {
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct BlockNumberResponse {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockResponse<B> {
    #[serde(default = "Option::default")]
    result: Option<B>,
}

/// Leading part of `body`, for error messages.
pub fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(MAX_DIAGNOSTIC_BODY)]).into_owned()
}

/// Surface an embedded `{"error": {...}}` object as [`FetchError::Rpc`].
///
/// Only a non-zero code together with a non-empty message counts as an error.
pub fn check_rpc_error(body: &[u8]) -> Result<(), FetchError> {
    let envelope: RpcErrorEnvelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode {
            reason: e.to_string(),
            body: body_snippet(body),
        })?;
    match envelope.error {
        Some(err) if err.code != 0 && !err.message.is_empty() => Err(FetchError::Rpc {
            code: err.code,
            message: err.message,
        }),
        _ => Ok(()),
    }
}

/// JSON-RPC client for the two calls the block fetcher makes.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    transport: Arc<dyn Transport>,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(url: String, transport: Arc<dyn Transport>) -> Self {
        Self { url, transport }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the current chain height via `eth_blockNumber`.
    pub async fn get_block_number(&self) -> Result<u64, FetchError> {
        let body = self
            .transport
            .post(&self.url, BLOCK_NUMBER_REQUEST.to_string())
            .await?;

        check_rpc_error(&body)?;

        let response: BlockNumberResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                reason: e.to_string(),
                body: body_snippet(&body),
            })?;
        let result = match response.result {
            Some(result) if !result.is_empty() => result,
            _ => return Err(FetchError::UnexpectedResponse(body_snippet(&body))),
        };
        parse_hex_u64(&result).map_err(|e| FetchError::Decode {
            reason: format!("failed to parse block number {:?}: {}", result, e),
            body: body_snippet(&body),
        })
    }

    /// Get the block at `height`.
    ///
    /// `full_tx` selects full transaction objects instead of hashes and must
    /// agree with the shape of `B`. A missing or zero-height block is an
    /// error: either the embedded RPC error, or an unexpected response.
    pub async fn get_block_by_number<B: BlockLike>(
        &self,
        height: u64,
        full_tx: bool,
    ) -> Result<B, FetchError> {
        let body = self
            .transport
            .post(&self.url, block_by_number_request(height, full_tx))
            .await?;

        let response: BlockResponse<B> =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                reason: e.to_string(),
                body: body_snippet(&body),
            })?;

        match response.result {
            Some(block) if !block.is_empty() => Ok(block),
            _ => {
                check_rpc_error(&body)?;
                Err(FetchError::UnexpectedResponse(body_snippet(&body)))
            }
        }
    }
}
