//! Aggregate managers and the per-run world they live in

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::errors::StitchError;
use super::ports::{AmEndpoint, ApiVersion};
use super::rspec::RSpec;
use super::stitching::{Hop, HopRef};
use super::value_objects::{AggregateUrn, PathId};

/// Allocation lifecycle of one aggregate within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum AllocationState {
    /// Not yet dispatched; waiting on dependencies or scheduler capacity
    Pending,
    /// An allocation task holds this aggregate
    InProgress,
    /// A manifest was accepted; downstream aggregates may read it
    Completed,
}

/// One independently administered resource provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    /// Canonical URN
    pub urn: AggregateUrn,
    /// Control URL; required before the engine may contact the AM
    pub url: Option<String>,
    /// AM API version spoken at `url`
    pub api_version: ApiVersion,
    /// Whether the manifest only becomes final after sliver-status polling
    pub dcn: bool,
    /// An allocation task currently holds this aggregate
    pub in_process: bool,
    /// The AM confirmed a manifest this run
    pub completed: bool,
    /// The AM was named in the user's request body (not only by the planner)
    pub user_requested: bool,
    /// Hops owned by this AM
    pub hops: Vec<HopRef>,
    /// Paths crossing this AM
    pub paths: BTreeSet<PathId>,
    /// Aggregates whose manifests feed this one's requests
    pub depends_on: BTreeSet<AggregateUrn>,
    /// Aggregates fed by this one's manifest
    pub is_dependency_for: BTreeSet<AggregateUrn>,
    /// The request document last sent to this AM
    pub request_doc: Option<String>,
    /// The manifest document last accepted from this AM
    pub manifest_doc: Option<String>,
}

impl Aggregate {
    /// New aggregate known only by URN
    pub fn new(urn: AggregateUrn) -> Self {
        Self {
            urn,
            url: None,
            api_version: ApiVersion::default(),
            dcn: false,
            in_process: false,
            completed: false,
            user_requested: false,
            hops: Vec::new(),
            paths: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            is_dependency_for: BTreeSet::new(),
            request_doc: None,
            manifest_doc: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> AllocationState {
        if self.completed {
            AllocationState::Completed
        } else if self.in_process {
            AllocationState::InProgress
        } else {
            AllocationState::Pending
        }
    }

    /// The endpoint to contact, or an error when no URL is configured
    pub fn endpoint(&self) -> Result<AmEndpoint, StitchError> {
        let url = self.url.clone().ok_or_else(|| {
            StitchError::Internal(format!("aggregate {} has no control URL", self.urn))
        })?;
        Ok(AmEndpoint {
            urn: self.urn.clone(),
            url,
            api_version: self.api_version,
        })
    }
}

/// The per-run registry of aggregates plus the bound request model.
///
/// Replaces a process-wide interning table: one `World` is built per
/// orchestration run and passed explicitly through the engine, so tests
/// need no global teardown. Interning happens only while documents are
/// being bound; the scheduler treats the registry as read-mostly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    /// The bound request
    pub rspec: RSpec,
    aggregates: BTreeMap<AggregateUrn, Aggregate>,
}

impl World {
    /// New world around a bound rspec
    pub fn new(rspec: RSpec) -> Self {
        Self {
            rspec,
            aggregates: BTreeMap::new(),
        }
    }

    /// The canonical aggregate for a URN, created on first reference
    pub fn aggregate_or_intern(&mut self, urn: &AggregateUrn) -> &mut Aggregate {
        self.rspec.am_urns.insert(urn.clone());
        self.aggregates
            .entry(urn.clone())
            .or_insert_with(|| Aggregate::new(urn.clone()))
    }

    /// Look up an aggregate
    pub fn aggregate(&self, urn: &AggregateUrn) -> Option<&Aggregate> {
        self.aggregates.get(urn)
    }

    /// Look up an aggregate, mutably
    pub fn aggregate_mut(&mut self, urn: &AggregateUrn) -> Option<&mut Aggregate> {
        self.aggregates.get_mut(urn)
    }

    /// All aggregates in URN order
    pub fn aggregates(&self) -> impl Iterator<Item = &Aggregate> {
        self.aggregates.values()
    }

    /// Resolve a hop reference
    pub fn hop(&self, href: &HopRef) -> Option<&Hop> {
        self.rspec.stitching.find_path(&href.path)?.hop(href.idx)
    }

    /// Resolve a hop reference, mutably
    pub fn hop_mut(&mut self, href: &HopRef) -> Option<&mut Hop> {
        self.rspec
            .stitching
            .find_path_mut(&href.path)?
            .hop_mut(href.idx)
    }

    /// Whether every dependency of `urn` has completed
    pub fn dependencies_complete(&self, urn: &AggregateUrn) -> bool {
        match self.aggregate(urn) {
            Some(agg) => agg
                .depends_on
                .iter()
                .all(|dep| self.aggregate(dep).map(|a| a.completed).unwrap_or(false)),
            None => false,
        }
    }

    /// Whether `urn` may be dispatched now
    pub fn is_ready(&self, urn: &AggregateUrn) -> bool {
        match self.aggregate(urn) {
            Some(agg) => {
                !agg.completed && !agg.in_process && self.dependencies_complete(urn)
            }
            None => false,
        }
    }

    /// Aggregates ready for dispatch, in URN order
    pub fn ready_aggregates(&self) -> Vec<AggregateUrn> {
        self.rspec
            .am_urns
            .iter()
            .filter(|urn| self.is_ready(urn))
            .cloned()
            .collect()
    }

    /// Whether every AM touched by the request has completed
    pub fn all_completed(&self) -> bool {
        self.rspec.am_urns.iter().all(|urn| {
            self.aggregate(urn)
                .map(|a| a.completed)
                .unwrap_or(false)
        })
    }

    /// Everything downstream of `urn` through `is_dependency_for`, `urn` excluded
    pub fn transitive_dependents(&self, urn: &AggregateUrn) -> BTreeSet<AggregateUrn> {
        let mut out = BTreeSet::new();
        let mut stack = vec![urn.clone()];
        while let Some(current) = stack.pop() {
            if let Some(agg) = self.aggregate(&current) {
                for dep in &agg.is_dependency_for {
                    if out.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        out.remove(urn);
        out
    }

    /// Reset `in_process` flags left behind by an aborted run.
    ///
    /// An aggregate caught mid-allocate has `in_process` set and no
    /// manifest; it re-enters the scheduler as Pending. Returns the URNs
    /// that were reset.
    pub fn clear_stale_in_process(&mut self) -> Vec<AggregateUrn> {
        let mut cleared = Vec::new();
        for agg in self.aggregates.values_mut() {
            if agg.in_process && agg.manifest_doc.is_none() {
                agg.in_process = false;
                cleared.push(agg.urn.clone());
            }
        }
        cleared
    }

    /// Check the model invariants that must hold at every quiescent point.
    pub fn check_invariants(&self) -> Result<(), StitchError> {
        for path in self.rspec.stitching.paths() {
            path.validate()?;
            for hop in path.hops() {
                if hop.import_vlans {
                    let from = hop.import_vlans_from.as_ref().ok_or_else(|| {
                        StitchError::Internal(format!(
                            "hop {} on path {} imports VLANs from nowhere",
                            hop.id,
                            path.id()
                        ))
                    })?;
                    let upstream = self.hop(from).ok_or_else(|| {
                        StitchError::Internal(format!(
                            "hop {} on path {} imports from a dangling hop",
                            hop.id,
                            path.id()
                        ))
                    })?;
                    if upstream.aggregate == hop.aggregate {
                        return Err(StitchError::Internal(format!(
                            "hop {} on path {} imports from its own aggregate",
                            hop.id,
                            path.id()
                        )));
                    }
                    let owner = self.aggregate(&hop.aggregate).ok_or_else(|| {
                        StitchError::Internal(format!("unknown aggregate {}", hop.aggregate))
                    })?;
                    if !owner.depends_on.contains(&upstream.aggregate) {
                        return Err(StitchError::Internal(format!(
                            "hop {} imports from {} but {} does not depend on it",
                            hop.id, upstream.aggregate, hop.aggregate
                        )));
                    }
                }
                if let Some(suggested) = hop.link.vlan_suggested_request.as_single() {
                    if !hop.link.vlan_range_request.contains(suggested) {
                        return Err(StitchError::Internal(format!(
                            "hop {} suggests VLAN {} outside its requested range",
                            hop.id, suggested
                        )));
                    }
                }
                if let Some(manifested) = hop.link.vlan_suggested_manifest {
                    if hop.vlans_unavailable.contains(manifested) {
                        return Err(StitchError::Internal(format!(
                            "hop {} holds manifest VLAN {} it knows to be unavailable",
                            hop.id, manifested
                        )));
                    }
                }
            }
        }

        for agg in self.aggregates.values() {
            if agg.completed {
                for href in &agg.hops {
                    let hop = self.hop(href).ok_or_else(|| {
                        StitchError::Internal(format!(
                            "aggregate {} owns a dangling hop reference",
                            agg.urn
                        ))
                    })?;
                    let manifested = hop.link.vlan_suggested_manifest.ok_or_else(|| {
                        StitchError::Internal(format!(
                            "aggregate {} is completed but hop {} has no manifest VLAN",
                            agg.urn, hop.id
                        ))
                    })?;
                    let in_range = hop
                        .link
                        .vlan_range_manifest
                        .as_ref()
                        .map(|r| r.contains(manifested))
                        .unwrap_or(false);
                    if !in_range {
                        return Err(StitchError::Internal(format!(
                            "aggregate {} manifest VLAN {} at hop {} is outside the manifest range",
                            agg.urn, manifested, hop.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
