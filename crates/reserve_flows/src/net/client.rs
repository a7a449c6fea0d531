//! Typed JSON and JSON-RPC calls over an injected [`Transport`].

use crate::net::transport::{HttpMethod, HttpRequest, Transport, TransportError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error("request: {0}")]
    Transport(#[from] TransportError),
    #[error("api error: status {status} body {body}")]
    Status { status: u16, body: String },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("decode {context}: {message}")]
    Decode { context: String, message: String },
}

impl RequestError {
    /// Transport failures, rate limiting and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Transport(_) => true,
            RequestError::Status { status, .. } => *status == 429 || *status >= 500,
            RequestError::Rpc { .. } | RequestError::Decode { .. } => false,
        }
    }

    pub(crate) fn decode(context: impl Into<String>, message: impl ToString) -> Self {
        RequestError::Decode {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC 2.0 reply. `Failure` is tried first so an `Option` result cannot swallow an
/// error object.
#[derive(Deserialize)]
#[serde(untagged)]
enum RpcReply<T> {
    Failure { error: RpcErrorObject },
    Success { result: T },
}

#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    metadata_timeout: Duration,
    next_id: Arc<AtomicU64>,
    request_count: Arc<AtomicU64>,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
            request_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, metadata_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.metadata_timeout = metadata_timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn metadata_timeout(&self) -> Duration {
        self.metadata_timeout
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// GET `url` and decode the body as `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<T, RequestError> {
        let body = self
            .execute(HttpRequest {
                method: HttpMethod::Get,
                url: url.to_string(),
                headers: headers.to_vec(),
                body: None,
                timeout: self.timeout,
            })
            .await?;
        serde_json::from_str(&body).map_err(|e| RequestError::decode(strip_query(url), e))
    }

    /// JSON-RPC call with the primary request timeout.
    pub async fn rpc<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RequestError> {
        self.rpc_with_timeout(url, method, params, self.timeout).await
    }

    /// JSON-RPC call for auxiliary metadata, bounded by the shorter metadata timeout.
    pub async fn rpc_metadata<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RequestError> {
        self.rpc_with_timeout(url, method, params, self.metadata_timeout)
            .await
    }

    async fn rpc_with_timeout<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "rpc call");
        let body = self
            .execute(HttpRequest {
                method: HttpMethod::Post,
                url: url.to_string(),
                headers: Vec::new(),
                body: Some(payload),
                timeout,
            })
            .await?;
        let reply: RpcReply<T> =
            serde_json::from_str(&body).map_err(|e| RequestError::decode(method, e))?;
        match reply {
            RpcReply::Success { result } => Ok(result),
            RpcReply::Failure { error } => Err(RequestError::Rpc {
                code: error.code,
                message: error.message,
            }),
        }
    }

    async fn execute(&self, request: HttpRequest) -> Result<String, RequestError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let resp = self.transport.send(request).await?;
        if !resp.is_success() {
            let mut body = resp.body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(RequestError::Status {
                status: resp.status,
                body,
            });
        }
        Ok(resp.body)
    }
}

/// Drop the query string so API keys never reach error messages or logs.
pub(crate) fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::HttpResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Canned {
        status: u16,
        body: &'static str,
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: self.status,
                body: self.body.to_string(),
            })
        }
    }

    fn client(status: u16, body: &'static str) -> (RequestClient, Arc<Canned>) {
        let t = Arc::new(Canned {
            status,
            body,
            seen: Mutex::new(Vec::new()),
        });
        (RequestClient::new(t.clone()), t)
    }

    #[tokio::test]
    async fn rpc_success() {
        let (c, t) = client(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#);
        let r: String = c.rpc("http://node", "eth_blockNumber", serde_json::json!([])).await.unwrap();
        assert_eq!(r, "0x10");
        let seen = t.seen.lock().unwrap();
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(seen[0].body.as_ref().unwrap()["method"], "eth_blockNumber");
        assert_eq!(c.request_count(), 1);
    }

    #[tokio::test]
    async fn rpc_error_object_is_surfaced() {
        let (c, _) = client(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"limit exceeded"}}"#,
        );
        let err = c
            .rpc::<Option<String>>("http://node", "eth_getLogs", serde_json::json!([]))
            .await
            .unwrap_err();
        match err {
            RequestError::Rpc { code, message } => {
                assert_eq!(code, -32005);
                assert_eq!(message, "limit exceeded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_result_decodes_as_none() {
        let (c, _) = client(200, r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        let r: Option<String> = c.rpc("http://node", "getTransaction", serde_json::json!([])).await.unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn status_error_carries_code() {
        let (c, _) = client(429, "slow down");
        let err = c.get_json::<serde_json::Value>("http://api/x?apikey=secret", &[]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn decode_error_hides_query() {
        let (c, _) = client(200, "not json");
        let err = c.get_json::<serde_json::Value>("http://api/x?apikey=secret", &[]).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn metadata_calls_use_short_timeout() {
        let (c, t) = client(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x"}"#);
        let c = c.with_timeouts(Duration::from_secs(30), Duration::from_secs(2));
        let _: String = c.rpc_metadata("http://node", "eth_call", serde_json::json!([])).await.unwrap();
        assert_eq!(t.seen.lock().unwrap()[0].timeout, Duration::from_secs(2));
    }
}
