//! Engine tuning knobs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scheduling and RPC policy for one engine instance.
///
/// The DCN polling constants are deliberately configurable: how long a
/// circuit-oriented AM takes to finalize a sliver varies per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline applied to every AM call
    pub rpc_timeout: Duration,
    /// First backoff after a busy AM; doubled on each further retry
    pub busy_initial_backoff: Duration,
    /// Reservation attempts allowed against a busy AM
    pub busy_max_attempts: u32,
    /// Allocation attempts per aggregate across VLAN-unavailable rejections
    pub negotiation_max_attempts: u32,
    /// Delay between sliver-status polls on DCN aggregates
    pub dcn_poll_interval: Duration,
    /// Sliver-status polls before the manifest is abandoned
    pub dcn_poll_max_attempts: u32,
    /// Directory receiving per-AM request documents for audit, none to disable
    pub request_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            busy_initial_backoff: Duration::from_secs(10),
            busy_max_attempts: 5,
            negotiation_max_attempts: 5,
            dcn_poll_interval: Duration::from_secs(30),
            dcn_poll_max_attempts: 20,
            request_dir: Some(PathBuf::from(".")),
        }
    }
}
