//! AM gateway wire types
//!
//! The gateway fronts each aggregate's control API with a uniform JSON
//! envelope: a verb plus the slice URN and, for reservations, the
//! request document. Replies carry the AM API's numeric result code.

use serde::{Deserialize, Serialize};

use crate::domain::{RpcError, VlanId};

/// AM API result codes recognized by the engine
pub mod codes {
    /// Operation succeeded
    pub const SUCCESS: i64 = 0;
    /// Credentials rejected
    pub const FORBIDDEN: i64 = 3;
    /// Aggregate is busy; retry later
    pub const BUSY: i64 = 14;
    /// The requested VLAN cannot be provided
    pub const VLAN_UNAVAILABLE: i64 = 24;
}

/// One call to the gateway
#[derive(Debug, Clone, Serialize)]
pub struct GatewayCall<'a> {
    /// AM API verb ("createsliver", "allocate", ...)
    pub method: &'a str,
    /// The slice being operated on
    pub slice_urn: &'a str,
    /// Request document for reservation verbs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rspec: Option<&'a str>,
}

/// The gateway's reply envelope
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayReply {
    /// AM API result code; zero is success
    pub code: i64,
    /// Verb-specific payload (manifest text, status structure)
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Human-readable detail accompanying a failure
    #[serde(default)]
    pub output: Option<String>,
}

impl GatewayReply {
    /// Map a non-success reply onto the port's error classification.
    pub fn into_rpc_error(self) -> RpcError {
        let detail = self.output.unwrap_or_default();
        match self.code {
            codes::BUSY => RpcError::Busy,
            codes::VLAN_UNAVAILABLE => RpcError::VlanUnavailable(offending_vlan(&detail)),
            codes::FORBIDDEN => RpcError::Auth(detail),
            code => RpcError::Other(format!("AM code {}: {}", code, detail)),
        }
    }
}

/// The first valid VLAN tag named in a failure message, if any.
fn offending_vlan(output: &str) -> Option<VlanId> {
    output
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u16>().ok())
        .find_map(|n| VlanId::try_new(n).ok())
}
