//! # Domain Ports (Hexagonal Architecture)
//!
//! Ports define the boundaries between the domain and external systems.
//! The reservation engine drives aggregate managers exclusively through
//! the [`AmClient`] port; adapters under `crate::adapters` implement it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::RpcError;
use super::value_objects::AggregateUrn;

/// AM API version; selects the verb pair used on the wire
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum ApiVersion {
    /// AM API v2
    #[default]
    #[strum(serialize = "2")]
    V2,
    /// AM API v3 and later
    #[strum(serialize = "3")]
    V3,
}

impl ApiVersion {
    /// The reservation verb for this version
    pub fn reserve_op(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "createsliver",
            ApiVersion::V3 => "allocate",
        }
    }

    /// The teardown verb for this version
    pub fn delete_op(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "deletesliver",
            ApiVersion::V3 => "delete",
        }
    }
}

/// Where and how to reach one aggregate manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmEndpoint {
    /// The AM's URN
    pub urn: AggregateUrn,
    /// The AM's control URL
    pub url: String,
    /// API version spoken at that URL
    pub api_version: ApiVersion,
}

/// Sliver state reported by an AM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum SliverStatus {
    /// Resources are provisioned and usable
    Ready,
    /// Provisioning failed
    Failed,
    /// Provisioning is still underway
    Pending,
}

/// Control-plane RPC surface of an aggregate manager (driven port).
///
/// The single dependency on external I/O: reserve a portion of the slice,
/// tear it down, or poll its provisioning status.
#[async_trait]
pub trait AmClient: Send + Sync {
    /// Submit a request document; returns the AM's manifest document
    async fn reserve(
        &self,
        endpoint: &AmEndpoint,
        slice: &str,
        request: &str,
    ) -> Result<String, RpcError>;

    /// Tear down this slice's reservation at the AM
    async fn delete(&self, endpoint: &AmEndpoint, slice: &str) -> Result<(), RpcError>;

    /// Poll provisioning status for this slice at the AM
    async fn sliver_status(&self, endpoint: &AmEndpoint, slice: &str)
        -> Result<SliverStatus, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_table_per_api_version() {
        assert_eq!(ApiVersion::V2.reserve_op(), "createsliver");
        assert_eq!(ApiVersion::V2.delete_op(), "deletesliver");
        assert_eq!(ApiVersion::V3.reserve_op(), "allocate");
        assert_eq!(ApiVersion::V3.delete_op(), "delete");
        assert_eq!(ApiVersion::V2.to_string(), "2");
    }
}
