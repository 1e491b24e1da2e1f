//! Configuration for ngext
//!
//! This crate handles:
//! - Global configuration (`~/.config/ngext/config.toml`)
//! - Location of the data directory (endpoint store, auth token, status snapshot)

mod error;
mod global;

pub use error::*;
pub use global::*;
