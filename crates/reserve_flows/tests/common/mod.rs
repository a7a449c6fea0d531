//! Scripted in-memory transport and fixture loading shared by the adapter tests.

#![allow(dead_code)]

use async_trait::async_trait;
use reserve_flows::net::{BackoffPolicy, HttpRequest, HttpResponse, Transport, TransportError};
use reserve_flows::{RequestClient, Window};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Reply = Result<HttpResponse, TransportError>;
type Matcher = Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>;
type Responder = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

enum Script {
    /// Replies in order; the last one repeats.
    Queue(VecDeque<Reply>),
    Func(Responder),
}

struct Route {
    matcher: Matcher,
    script: Script,
}

/// First matching route answers; unmatched requests fail with a transport error.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, matcher: impl Fn(&HttpRequest) -> bool + Send + Sync + 'static, replies: Vec<Reply>) {
        self.routes.lock().unwrap().push(Route {
            matcher: Box::new(matcher),
            script: Script::Queue(replies.into()),
        });
    }

    pub fn on_fn(
        &self,
        matcher: impl Fn(&HttpRequest) -> bool + Send + Sync + 'static,
        responder: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
    ) {
        self.routes.lock().unwrap().push(Route {
            matcher: Box::new(matcher),
            script: Script::Func(Box::new(responder)),
        });
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.url).collect()
    }

    pub fn rpc_methods(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.body.as_ref())
            .filter_map(|b| b["method"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        for route in routes.iter_mut() {
            if !(route.matcher)(&request) {
                continue;
            }
            return match &mut route.script {
                Script::Queue(q) if q.len() > 1 => q.pop_front().unwrap(),
                Script::Queue(q) => q
                    .front()
                    .cloned()
                    .unwrap_or_else(|| Err(TransportError::Other("empty script".into()))),
                Script::Func(f) => f(&request),
            };
        }
        Err(TransportError::Other(format!("no route for {}", request.url)))
    }
}

pub fn client(transport: &Arc<MockTransport>) -> RequestClient {
    RequestClient::new(transport.clone())
}

pub fn ok(body: impl Into<String>) -> Reply {
    Ok(HttpResponse::ok(body))
}

pub fn ok_json(body: &Value) -> Reply {
    ok(body.to_string())
}

pub fn status(code: u16, body: &str) -> Reply {
    Ok(HttpResponse {
        status: code,
        body: body.to_string(),
    })
}

pub fn rpc_result(result: Value) -> Reply {
    ok_json(&json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

pub fn rpc_error(code: i64, message: &str) -> Reply {
    ok_json(&json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}}))
}

pub fn url_has(fragment: &'static str) -> impl Fn(&HttpRequest) -> bool + Send + Sync + 'static {
    move |r| r.url.contains(fragment)
}

pub fn url_ends(suffix: &'static str) -> impl Fn(&HttpRequest) -> bool + Send + Sync + 'static {
    move |r| r.url.ends_with(suffix)
}

pub fn rpc_method(method: &'static str) -> impl Fn(&HttpRequest) -> bool + Send + Sync + 'static {
    move |r| {
        r.body
            .as_ref()
            .is_some_and(|b| b["method"].as_str() == Some(method))
    }
}

pub fn params(r: &HttpRequest) -> Value {
    r.body
        .as_ref()
        .map(|b| b["params"].clone())
        .unwrap_or(Value::Null)
}

pub fn fixture(path: &str) -> String {
    let full = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../testdata")
        .join(path);
    std::fs::read_to_string(&full).unwrap_or_else(|e| panic!("read {}: {}", full.display(), e))
}

pub fn fixture_json(path: &str) -> Value {
    serde_json::from_str(&fixture(path)).unwrap_or_else(|e| panic!("parse {}: {}", path, e))
}

/// No waiting between retries.
pub fn instant_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 1,
        jitter: 0.0,
    }
}

/// 2024-03-04T00:00Z .. 2024-03-11T00:00Z, ISO week 2024-W10.
pub fn week10() -> Window {
    Window::parse_rfc3339("2024-03-04T00:00:00Z", "2024-03-11T00:00:00Z").unwrap()
}
