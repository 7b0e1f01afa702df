//! `leaselog-core`: identifiers and validation shared by every layer.
//!
//! This crate contains **pure** primitives (no I/O).

pub mod dispatcher;
pub mod error;
pub mod id;
pub mod state;

pub use dispatcher::{DispatcherId, PORTABLE_DISPATCHER_ID_MAX_LEN};
pub use error::{ConfigError, ConfigResult};
pub use id::StreamId;
pub use state::StateToken;
