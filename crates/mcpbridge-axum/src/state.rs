//! Shared application state type.

use crate::bootstrap::BridgeContext;
use std::sync::Arc;

/// Application state shared across all handlers: an Arc-wrapped
/// [`BridgeContext`] holding the supervisor, the relay port and both
/// subscriber engines.
pub type AppState = Arc<BridgeContext>;
