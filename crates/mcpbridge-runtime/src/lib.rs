//! Supervised child-process runtime.
//!
//! Owns the bridged tool's process: spawning, stdin writes, stdout/stderr
//! readers, crash-restart with exponential backoff, and graceful
//! SIGTERM → SIGKILL shutdown.

mod reader;
mod shutdown;
pub mod supervisor;

pub use supervisor::{ProcessSupervisor, SupervisorOptions, backoff_delay};
