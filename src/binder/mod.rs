//! Document binder: request/manifest XML in and out of the model
//!
//! Reading uses `roxmltree` (namespace-prefix agnostic, local names
//! only); writing rebuilds a document from the model with the
//! `quick-xml` event writer rather than mutating a DOM clone.

pub mod manifest;
pub mod request;

pub use manifest::{manifest_hop_vlans, RawHopVlans};
pub use request::{read_request, write_request};
