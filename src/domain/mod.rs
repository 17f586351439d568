//! # Stitching Domain Layer
//!
//! The data model of one cross-aggregate slice: VLAN range algebra, the
//! stitched paths and hops, the per-run aggregate registry ([`World`]),
//! and the driven port the engine uses to talk to aggregate managers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        World (per run)                       │
//! │  ┌────────────────────────────┐   ┌───────────────────────┐  │
//! │  │ RSpec                      │   │ Aggregate registry    │  │
//! │  │  stitching: Path → Hop →   │   │  urn → Aggregate      │  │
//! │  │    HopLink (vlan ranges)   │   │  dependsOn /          │  │
//! │  │  nodes, links (main body)  │   │  isDependencyFor      │  │
//! │  └────────────────────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ AmClient (driven port)
//!                              ▼
//!                 aggregate managers (reserve / delete / status)
//! ```
//!
//! Hops reference each other through [`stitching::HopRef`] lookups, never
//! shared pointers; the registry is interned while binding documents and
//! read-mostly while the scheduler runs.

pub mod aggregate;
pub mod errors;
pub mod ports;
pub mod rspec;
pub mod stitching;
pub mod value_objects;

// Re-exports - explicit to avoid ambiguity
pub use aggregate::{Aggregate, AllocationState, World};
pub use errors::{RpcError, StitchError};
pub use ports::{AmClient, AmEndpoint, ApiVersion, SliverStatus};
pub use rspec::{InterfaceRef, Link, Node, RSpec};
pub use stitching::{Hop, HopLink, HopRef, Path, Stitching};
pub use value_objects::{
    AggregateUrn, PathId, VlanId, VlanIdError, VlanRange, VlanRangeParseError, VLAN_MAX, VLAN_MIN,
};
