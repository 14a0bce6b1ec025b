//! Core domain types for the mcpbridge transport adapter.
//!
//! This crate holds the pure logic shared by the runtime and HTTP layers:
//! JSON-RPC envelope validation, newline framing of child output,
//! configuration loading, and the capability traits (ports) that the
//! composition root wires together. It performs no I/O beyond reading the
//! tool configuration file.

pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod ports;

// Re-export commonly used types for convenience
pub use config::{BridgeSettings, InputDecl, ToolSpec, config_path_from_env, load_tool_spec};
pub use envelope::{MessageKind, classify, normalize_body, validate_frame};
pub use error::{ConfigError, EnvelopeError, ProcessError};
pub use frame::FrameSplitter;
pub use ports::{ChildEvents, FrameRelay, ProcessState};
