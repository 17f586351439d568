//! # Stitchnet
//!
//! Cross-aggregate network slice stitching engine.
//!
//! Given a resource request whose stitched links traverse several
//! independently administered aggregate managers, this crate computes
//! the order in which the aggregates must be contacted, threads VLAN
//! selections from producer to consumer hops, and converges on a
//! mutually consistent VLAN assignment for every hop on every path —
//! tearing reservations back down and redoing them when an upstream
//! change invalidates a downstream manifest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod binder;
pub mod domain;
pub mod engine;

pub use domain::{
    Aggregate, AggregateUrn, AllocationState, AmClient, AmEndpoint, ApiVersion, Hop, HopLink,
    HopRef, Path, PathId, RSpec, RpcError, SliverStatus, StitchError, Stitching, VlanId,
    VlanRange, World,
};

pub use binder::{read_request, write_request};
pub use engine::{EngineConfig, ReservationEngine, RunReport};
