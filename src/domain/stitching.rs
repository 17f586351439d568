//! Stitched paths, hops, and hop links

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::errors::StitchError;
use super::value_objects::{AggregateUrn, PathId, VlanId, VlanRange};

/// Location of one hop inside the stitching section.
///
/// Cross-hop references (next hop, VLAN import source, dependencies) are
/// carried as these lookups rather than as shared pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopRef {
    /// Owning path
    pub path: PathId,
    /// Ordinal of the hop on that path
    pub idx: usize,
}

/// One endpoint of a stitched edge, identified by its component URN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopLink {
    /// Component URN of the endpoint
    pub urn: String,
    /// Whether the owning AM translates VLAN tags at this endpoint
    pub vlan_xlate: bool,
    /// Tags we will permit the AM to choose from on the next request
    pub vlan_range_request: VlanRange,
    /// Tags we will suggest on the next request
    pub vlan_suggested_request: VlanRange,
    /// Tags the AM confirmed as available, absent until a reservation succeeds
    pub vlan_range_manifest: Option<VlanRange>,
    /// The single tag the AM reserved, absent until a reservation succeeds
    pub vlan_suggested_manifest: Option<VlanId>,
}

impl HopLink {
    /// New link with unconstrained request ranges
    pub fn new(urn: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            vlan_xlate: false,
            vlan_range_request: VlanRange::any(),
            vlan_suggested_request: VlanRange::any(),
            vlan_range_manifest: None,
            vlan_suggested_manifest: None,
        }
    }

    /// Drop manifest state, keeping the request fields
    pub fn clear_manifest(&mut self) {
        self.vlan_range_manifest = None;
        self.vlan_suggested_manifest = None;
    }
}

/// A path-specific reference to one hop link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    /// Path-local hop id from the document
    pub id: String,
    /// Ordinal on the path; kept equal to the hop's position
    pub idx: usize,
    /// The endpoint this hop binds
    pub link: HopLink,
    /// Index of the successor hop on the same path, none on the last hop
    pub next_hop: Option<usize>,
    /// Owning path
    pub path: PathId,
    /// AM that owns this hop
    pub aggregate: AggregateUrn,
    /// SCS directive: the planner may re-route this hop
    pub loose: bool,
    /// Ask the planner to avoid this hop on the next computation
    pub exclude_from_scs: bool,
    /// Whether this hop's request is fed from an upstream manifest
    pub import_vlans: bool,
    /// The hop whose manifest feeds this one's request
    pub import_vlans_from: Option<HopRef>,
    /// Hops this one waits on
    pub dependencies: Vec<HopRef>,
    /// Tags known to fail at this hop
    pub vlans_unavailable: VlanRange,
}

impl Hop {
    /// New hop bound to `link`; ordinal and back-references are assigned
    /// when the hop is pushed onto its path.
    pub fn new(id: impl Into<String>, link: HopLink, aggregate: AggregateUrn) -> Self {
        Self {
            id: id.into(),
            idx: 0,
            link,
            next_hop: None,
            path: PathId::new(""),
            aggregate,
            loose: false,
            exclude_from_scs: false,
            import_vlans: false,
            import_vlans_from: None,
            dependencies: Vec::new(),
            vlans_unavailable: VlanRange::empty(),
        }
    }

    /// Location of this hop
    pub fn href(&self) -> HopRef {
        HopRef {
            path: self.path.clone(),
            idx: self.idx,
        }
    }
}

/// An ordered chain of hops sharing one path id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    id: PathId,
    hops: Vec<Hop>,
}

impl Path {
    /// New empty path
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            hops: Vec::new(),
        }
    }

    /// The path id
    pub fn id(&self) -> &PathId {
        &self.id
    }

    /// Append a hop, assigning its ordinal and back-reference
    pub fn push(&mut self, mut hop: Hop) {
        hop.idx = self.hops.len();
        hop.path = self.id.clone();
        self.hops.push(hop);
    }

    /// Hops in path order
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Mutable hops in path order
    pub fn hops_mut(&mut self) -> &mut [Hop] {
        &mut self.hops
    }

    /// Hop at an ordinal
    pub fn hop(&self, idx: usize) -> Option<&Hop> {
        self.hops.get(idx)
    }

    /// Mutable hop at an ordinal
    pub fn hop_mut(&mut self, idx: usize) -> Option<&mut Hop> {
        self.hops.get_mut(idx)
    }

    /// Find a hop by its path-local id
    pub fn find_hop(&self, hop_id: &str) -> Option<&Hop> {
        self.hops.iter().find(|h| h.id == hop_id)
    }

    /// Find a hop by its link URN
    pub fn find_hop_by_urn(&self, urn: &str) -> Option<&Hop> {
        self.hops.iter().find(|h| h.link.urn == urn)
    }

    /// The set of aggregates appearing on this path
    pub fn aggregates(&self) -> BTreeSet<AggregateUrn> {
        self.hops.iter().map(|h| h.aggregate.clone()).collect()
    }

    /// Check the ordering invariants: `hops[i].idx == i` and the next-hop
    /// chain runs `i -> i+1` with none on the last hop.
    pub fn validate(&self) -> Result<(), StitchError> {
        let last = self.hops.len().saturating_sub(1);
        for (i, hop) in self.hops.iter().enumerate() {
            if hop.idx != i {
                return Err(StitchError::Internal(format!(
                    "hop {} on path {} has ordinal {} at position {}",
                    hop.id, self.id, hop.idx, i
                )));
            }
            let expected = if i == last { None } else { Some(i + 1) };
            if hop.next_hop != expected {
                return Err(StitchError::Internal(format!(
                    "hop {} on path {} breaks the next-hop chain",
                    hop.id, self.id
                )));
            }
        }
        Ok(())
    }
}

/// The stitching section: paths plus the planner's last-update stamp
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stitching {
    /// Raw `lastUpdateTime` attribute text, kept verbatim
    pub last_update: Option<String>,
    paths: Vec<Path>,
}

impl Stitching {
    /// New stitching section
    pub fn new(last_update: Option<String>) -> Self {
        Self {
            last_update,
            paths: Vec::new(),
        }
    }

    /// The last-update stamp, when it parses as RFC 3339
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Add a path
    pub fn push_path(&mut self, path: Path) {
        self.paths.push(path);
    }

    /// Paths in document order
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Mutable paths in document order
    pub fn paths_mut(&mut self) -> &mut [Path] {
        &mut self.paths
    }

    /// Find the path with the given id
    pub fn find_path(&self, id: &PathId) -> Option<&Path> {
        self.paths.iter().find(|p| p.id() == id)
    }

    /// Find the path with the given id, mutably
    pub fn find_path_mut(&mut self, id: &PathId) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| p.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(id: &str, am: &str) -> Hop {
        Hop::new(
            id,
            HopLink::new(format!("urn:publicid:IDN+{am}+interface+sw:{id}")),
            AggregateUrn::for_authority(am),
        )
    }

    fn chained_path(n: usize) -> Path {
        let mut path = Path::new(PathId::new("link-0"));
        for i in 0..n {
            path.push(hop(&(i + 1).to_string(), "emulab.net"));
        }
        for i in 0..n {
            path.hop_mut(i).unwrap().next_hop = if i + 1 < n { Some(i + 1) } else { None };
        }
        path
    }

    #[test]
    fn push_assigns_ordinals_and_backrefs() {
        let path = chained_path(3);
        for (i, h) in path.hops().iter().enumerate() {
            assert_eq!(h.idx, i);
            assert_eq!(h.path, PathId::new("link-0"));
        }
        assert!(path.validate().is_ok());
    }

    #[test]
    fn validate_rejects_broken_chain() {
        let mut path = chained_path(3);
        path.hop_mut(0).unwrap().next_hop = None;
        assert!(path.validate().is_err());
    }

    #[test]
    fn find_hop_by_id_and_urn() {
        let path = chained_path(2);
        assert_eq!(path.find_hop("2").unwrap().idx, 1);
        assert!(path
            .find_hop_by_urn("urn:publicid:IDN+emulab.net+interface+sw:1")
            .is_some());
        assert!(path.find_hop("9").is_none());
    }

    #[test]
    fn last_update_parses_rfc3339() {
        let stitching = Stitching::new(Some("2024-03-01T12:00:00Z".to_string()));
        assert!(stitching.last_update_time().is_some());
        let stitching = Stitching::new(Some("20240301".to_string()));
        assert!(stitching.last_update_time().is_none());
        assert_eq!(stitching.last_update.as_deref(), Some("20240301"));
    }
}
