//! VLAN negotiation: thread upstream manifests into downstream requests

use crate::domain::{AggregateUrn, HopRef, StitchError, VlanRange, World};

/// What the scheduler must do with an aggregate after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationOutcome {
    /// A prior manifest at this AM is stale and must be torn down first
    pub must_delete: bool,
    /// The prior manifest still satisfies every owned hop; skip the RPC
    pub already_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopOutcome {
    /// Request fields unchanged and the existing manifest covers them
    Satisfied,
    /// Request fields rewritten; any existing manifest remains consistent
    Updated,
    /// The existing manifest contradicts the new request
    NeedsRedo,
}

/// Recompute every owned hop's request fields from upstream manifests
/// and local rejection history, and decide whether the AM's prior
/// manifest survives.
pub fn negotiate(
    world: &mut World,
    aggregate: &AggregateUrn,
) -> Result<NegotiationOutcome, StitchError> {
    let (hop_refs, has_manifest) = {
        let agg = world
            .aggregate(aggregate)
            .ok_or_else(|| StitchError::Internal(format!("unknown aggregate {}", aggregate)))?;
        (agg.hops.clone(), agg.manifest_doc.is_some())
    };

    let mut must_delete = false;
    let mut all_satisfied = true;
    for href in &hop_refs {
        match negotiate_hop(world, href, has_manifest)? {
            HopOutcome::Satisfied => {}
            HopOutcome::Updated => all_satisfied = false,
            HopOutcome::NeedsRedo => {
                all_satisfied = false;
                must_delete = true;
            }
        }
    }

    Ok(NegotiationOutcome {
        must_delete,
        already_done: has_manifest && all_satisfied && !must_delete,
    })
}

fn negotiate_hop(
    world: &mut World,
    href: &HopRef,
    agg_has_manifest: bool,
) -> Result<HopOutcome, StitchError> {
    let hop = world
        .hop(href)
        .ok_or_else(|| StitchError::Internal("dangling hop reference".to_string()))?;

    if !hop.import_vlans {
        return negotiate_local_hop(world, href, agg_has_manifest);
    }

    let path = hop.path.clone();
    let hop_id = hop.id.clone();
    let current_suggested = hop.link.vlan_suggested_request.clone();
    let current_range = hop.link.vlan_range_request.clone();
    let unavailable = hop.vlans_unavailable.clone();
    let old_manifest = hop.link.vlan_suggested_manifest;

    let upstream_ref = hop.import_vlans_from.clone().ok_or_else(|| {
        StitchError::Internal(format!(
            "hop {} on path {} imports VLANs from nowhere",
            hop_id, path
        ))
    })?;
    let upstream = world
        .hop(&upstream_ref)
        .ok_or_else(|| StitchError::Internal("dangling import source".to_string()))?;

    let new_suggested = upstream
        .link
        .vlan_suggested_manifest
        .map(VlanRange::single)
        .unwrap_or(current_suggested.clone());
    let upstream_range = upstream
        .link
        .vlan_range_manifest
        .clone()
        .unwrap_or_else(VlanRange::any);
    let new_avail = upstream_range.intersect(&current_range).subtract(&unavailable);

    if new_suggested.is_subset_of(&unavailable) {
        return Err(StitchError::NoFeasibleVlan {
            path,
            hop: hop_id,
        });
    }
    if new_avail.is_empty() {
        return Err(StitchError::NoFeasibleVlan {
            path,
            hop: hop_id,
        });
    }
    if !new_suggested.is_subset_of(&new_avail) {
        return Err(StitchError::InconsistentVlan {
            path,
            hop: hop_id,
            detail: format!(
                "suggested {} is outside the feasible range {}",
                new_suggested, new_avail
            ),
        });
    }

    let outcome = match old_manifest {
        None => HopOutcome::Updated,
        Some(old) if agg_has_manifest => {
            if current_suggested == new_suggested && current_range == new_avail {
                return Ok(HopOutcome::Satisfied);
            } else if VlanRange::single(old) == new_suggested {
                HopOutcome::Updated
            } else {
                HopOutcome::NeedsRedo
            }
        }
        Some(_) => HopOutcome::Updated,
    };

    let hop = world.hop_mut(href).expect("hop resolved above");
    hop.link.vlan_suggested_request = new_suggested;
    hop.link.vlan_range_request = new_avail;
    Ok(outcome)
}

/// A hop whose request is user-supplied: leave it alone unless earlier
/// rejections force a different tag, in which case any legal value will
/// do.
fn negotiate_local_hop(
    world: &mut World,
    href: &HopRef,
    agg_has_manifest: bool,
) -> Result<HopOutcome, StitchError> {
    let hop = world.hop(href).expect("hop resolved by caller");
    let unavailable = hop.vlans_unavailable.clone();
    if unavailable.is_empty() {
        return Ok(if agg_has_manifest {
            HopOutcome::Satisfied
        } else {
            HopOutcome::Updated
        });
    }

    let path = hop.path.clone();
    let hop_id = hop.id.clone();
    let candidates = hop.link.vlan_range_request.subtract(&unavailable);
    if candidates.is_empty() {
        return Err(StitchError::NoFeasibleVlan {
            path,
            hop: hop_id,
        });
    }
    let narrowed = hop.link.vlan_suggested_request.subtract(&unavailable);
    let new_suggested = if narrowed.is_empty() {
        VlanRange::single(candidates.first().expect("candidates are non-empty"))
    } else {
        narrowed
    };

    let changed = new_suggested != hop.link.vlan_suggested_request
        || candidates != hop.link.vlan_range_request;
    let stale_manifest = hop
        .link
        .vlan_suggested_manifest
        .map(|m| !new_suggested.contains(m) || unavailable.contains(m))
        .unwrap_or(false);

    let hop = world.hop_mut(href).expect("hop resolved above");
    hop.link.vlan_suggested_request = new_suggested;
    hop.link.vlan_range_request = candidates;

    Ok(if stale_manifest && agg_has_manifest {
        HopOutcome::NeedsRedo
    } else if changed {
        HopOutcome::Updated
    } else if agg_has_manifest {
        HopOutcome::Satisfied
    } else {
        HopOutcome::Updated
    })
}
