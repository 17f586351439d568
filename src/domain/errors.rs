//! Domain errors

use thiserror::Error;

use super::value_objects::{AggregateUrn, PathId, VlanId, VlanRange, VlanRangeParseError};

/// Errors surfaced by the AM-facing RPC port
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("aggregate manager is busy")]
    Busy,

    #[error("requested VLAN is unavailable at the aggregate")]
    VlanUnavailable(Option<VlanId>),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("call timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Busy and VLAN-unavailable are recoverable; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RpcError::Busy | RpcError::VlanUnavailable(_))
    }
}

/// Stitching engine errors
#[derive(Error, Debug)]
pub enum StitchError {
    #[error("failed to parse document: {0}")]
    Parse(String),

    #[error("manifest from {aggregate} is malformed at hop {hop}: {detail}")]
    ManifestMalformed {
        aggregate: AggregateUrn,
        hop: String,
        detail: String,
    },

    #[error("manifest from {aggregate} is invalid at hop {hop}: {detail}")]
    ManifestInvalid {
        aggregate: AggregateUrn,
        hop: String,
        detail: String,
    },

    #[error("manifest VLAN {manifested} at hop {hop} of {aggregate} is outside the requested {requested}")]
    VlanMismatch {
        aggregate: AggregateUrn,
        hop: String,
        requested: VlanRange,
        manifested: VlanRange,
    },

    #[error("no feasible VLAN remains for hop {hop} on path {path}")]
    NoFeasibleVlan { path: PathId, hop: String },

    #[error("inconsistent VLAN state at hop {hop} on path {path}: {detail}")]
    InconsistentVlan {
        path: PathId,
        hop: String,
        detail: String,
    },

    #[error("aggregate dependency cycle among [{}]", join_urns(.0))]
    Cycle(Vec<AggregateUrn>),

    #[error("RPC to {aggregate} failed: {source}")]
    Rpc {
        aggregate: AggregateUrn,
        #[source]
        source: RpcError,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("stitching invariant violated: {0}")]
    Internal(String),
}

impl From<VlanRangeParseError> for StitchError {
    fn from(err: VlanRangeParseError) -> Self {
        StitchError::Parse(err.to_string())
    }
}

fn join_urns(urns: &[AggregateUrn]) -> String {
    urns.iter()
        .map(|u| u.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
