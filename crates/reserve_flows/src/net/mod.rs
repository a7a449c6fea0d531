//! Outbound requests: injectable transport, typed JSON/JSON-RPC client, backoff and
//! pagination guards.

mod backoff;
mod client;
mod paging;
mod transport;

pub use backoff::{BackoffPolicy, RetryState};
pub(crate) use client::strip_query;
pub use client::{RequestClient, RequestError, RpcErrorObject, DEFAULT_METADATA_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use paging::{Advance, PageGuard, PagingError, PagingLimits};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};
