//! Dependency builder: VLAN import chains and the aggregate ordering

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use std::collections::BTreeMap;

use crate::domain::{AggregateUrn, HopRef, StitchError, World};

/// Populate VLAN import chains and aggregate dependency sets.
///
/// Adjacent hops (A, B) on one path owned by different aggregates make B
/// import A's manifested VLAN, unless A translates tags — a translator
/// breaks the chain and B keeps its user-supplied request. Idempotent;
/// fails with [`StitchError::Cycle`] before any edge could be acted on.
pub fn build_dependencies(world: &mut World) -> Result<(), StitchError> {
    let mut imports: Vec<(HopRef, HopRef)> = Vec::new();
    for path in world.rspec.stitching.paths() {
        for pair in path.hops().windows(2) {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            if upstream.aggregate == downstream.aggregate {
                continue;
            }
            if upstream.link.vlan_xlate {
                // Translated tags need not match; downstream keeps its own request.
                continue;
            }
            imports.push((downstream.href(), upstream.href()));
        }
    }

    for (down_ref, up_ref) in imports {
        let up_agg = world
            .hop(&up_ref)
            .map(|h| h.aggregate.clone())
            .ok_or_else(|| StitchError::Internal("dangling upstream hop".to_string()))?;
        let down_agg = {
            let hop = world
                .hop_mut(&down_ref)
                .ok_or_else(|| StitchError::Internal("dangling downstream hop".to_string()))?;
            hop.import_vlans = true;
            hop.import_vlans_from = Some(up_ref.clone());
            if !hop.dependencies.contains(&up_ref) {
                hop.dependencies.push(up_ref.clone());
            }
            hop.aggregate.clone()
        };
        world
            .aggregate_or_intern(&down_agg)
            .depends_on
            .insert(up_agg.clone());
        world
            .aggregate_or_intern(&up_agg)
            .is_dependency_for
            .insert(down_agg);
    }

    check_acyclic(world)
}

/// Verify that a topological order exists over the aggregates.
pub fn check_acyclic(world: &World) -> Result<(), StitchError> {
    let mut graph = DiGraph::<AggregateUrn, ()>::new();
    let mut nodes = BTreeMap::new();
    for agg in world.aggregates() {
        nodes.insert(agg.urn.clone(), graph.add_node(agg.urn.clone()));
    }
    for agg in world.aggregates() {
        for dep in &agg.depends_on {
            if let Some(&from) = nodes.get(dep) {
                graph.add_edge(from, nodes[&agg.urn], ());
            }
        }
    }

    if toposort(&graph, None).is_ok() {
        return Ok(());
    }

    let mut members: Vec<AggregateUrn> = tarjan_scc(&graph)
        .into_iter()
        .find(|scc| scc.len() > 1)
        .map(|scc| scc.into_iter().map(|ix| graph[ix].clone()).collect())
        .unwrap_or_default();
    if members.is_empty() {
        // A self-dependency forms a single-node cycle.
        members = graph
            .node_indices()
            .filter(|&ix| graph.find_edge(ix, ix).is_some())
            .map(|ix| graph[ix].clone())
            .collect();
    }
    members.sort();
    Err(StitchError::Cycle(members))
}
