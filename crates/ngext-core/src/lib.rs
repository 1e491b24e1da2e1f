//! Endpoint configuration and tunnel synchronization for ngext
//!
//! This crate provides:
//! - Auth state gating every tunnel operation
//! - Per-endpoint options, their validation and the debounce of edits
//! - The tunnel reconciler (desired vs. actual tunnels per container port)
//! - The container registry and the display rows merged with tunnel state
//! - The endpoint store and status snapshot shared with the CLI
//! - `AppShell`, which composes all of the above and runs the daemon loop

mod auth;
mod debounce;
mod error;
mod options;
mod reconciler;
mod registry;
mod shell;
mod store;

pub use auth::*;
pub use debounce::*;
pub use error::*;
pub use options::*;
pub use reconciler::*;
pub use registry::*;
pub use shell::*;
pub use store::{store_key, EndpointConfig, EndpointStore, StatusSnapshot, STATUS_FILE, STORE_FILE};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
