//! Main-body request entities: nodes, links, and the rspec root

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::stitching::{HopRef, Path, Stitching};
use super::value_objects::{AggregateUrn, PathId};

/// Reference from a link to a node interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceRef {
    /// The interface's client_id
    pub client_id: String,
}

/// A main-body (non-stitching) link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// The link's client_id; stitched links share this id with their path
    pub client_id: String,
    /// Component managers named on the link
    pub aggregates: Vec<AggregateUrn>,
    /// Interfaces the link connects
    pub interfaces: Vec<InterfaceRef>,
    /// Whether the link carries the shared-VLAN extension
    pub has_shared_vlan: bool,
}

/// A main-body node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// The node's client_id
    pub client_id: String,
    /// The AM the node is bound to, when specified
    pub component_manager: Option<AggregateUrn>,
}

/// Root entity for one resource request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RSpec {
    /// The stitching section
    pub stitching: Stitching,
    /// Main-body nodes
    pub nodes: Vec<Node>,
    /// Main-body links
    pub links: Vec<Link>,
    /// The original document text as received
    pub document: String,
    /// Every AM touched by this request
    pub am_urns: BTreeSet<AggregateUrn>,
}

impl RSpec {
    /// Find the stitching path for a link id
    pub fn find_path(&self, id: &PathId) -> Option<&Path> {
        self.stitching.find_path(id)
    }

    /// Find the main-body link with the given client_id
    pub fn find_link(&self, client_id: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.client_id == client_id)
    }

    /// Locate the hop bound to a link URN, searching every path
    pub fn find_hop_by_urn(&self, urn: &str) -> Option<HopRef> {
        self.stitching
            .paths()
            .iter()
            .find_map(|p| p.find_hop_by_urn(urn).map(|h| h.href()))
    }
}
