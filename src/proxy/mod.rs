//! Upstream plumbing: connection pooling, request forwarding, stream relay.

mod forwarder;
mod pool;
mod relay;

pub use forwarder::{is_streaming_request, ForwardOutcome, ForwardResult, Forwarder, ForwarderConfig};
pub use pool::{ConnectionGuard, ConnectionPoolManager, PoolConfig, PoolStats};
pub use relay::{forward_stream, is_streaming_response, RelayConfig, StreamResult};
