//! # Adapter Layer
//!
//! Adapters implement the domain's `AmClient` port for specific
//! control-plane backends.
//!
//! - `geni/` - the JSON gateway fronting real aggregate managers
//! - `mock` - a scripted in-memory AM for the test suite

pub mod geni;
pub mod mock;

pub use geni::{GeniGatewayClient, GeniGatewayConfig};
pub use mock::{CallKind, CallRecord, MockAmClient, MockReply};
