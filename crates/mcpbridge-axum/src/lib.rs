//! HTTP transport adapter for the mcpbridge stdio JSON-RPC bridge.
//!
//! Exposes the supervised child over three surfaces: a fire-and-forget
//! ingress POST, an event-stream egress and a chunked-ndjson egress, plus
//! health and service-info endpoints.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod routes;
pub mod state;

// Re-export primary types
pub use bootstrap::{BridgeContext, bootstrap, start_server};
pub use engine::{EngineConfig, StreamEngine, WireFormat};
pub use error::HttpError;
pub use routes::create_router;
pub use state::AppState;
