//! Reservation engine: dependency-ordered allocation across aggregates

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binder;
use crate::domain::{
    AggregateUrn, AmClient, AmEndpoint, HopRef, RpcError, SliverStatus, StitchError, VlanId,
    VlanRange, World,
};

use super::config::EngineConfig;
use super::deps;
use super::negotiation;

/// Summary of one engine run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Correlates log lines and audit files from this run
    pub run_id: Uuid,
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Aggregates completed at the end of the run
    pub aggregates_completed: usize,
    /// Reservation RPCs issued, retries included
    pub reserve_calls: u64,
    /// Teardown RPCs issued
    pub delete_calls: u64,
    /// Hops marked for exclusion on the next planner round
    pub scs_exclusions: Vec<HopRef>,
}

#[derive(Default)]
struct RunStats {
    reserve_calls: AtomicU64,
    delete_calls: AtomicU64,
}

/// Drives every aggregate of a slice through the allocation lifecycle.
///
/// Ready aggregates (no incomplete dependencies) run as independent
/// tasks; a task owns its aggregate's hops for the duration and reads
/// upstream hops only once their owner has completed. One engine value
/// can serve several runs.
pub struct ReservationEngine {
    client: Arc<dyn AmClient>,
    config: EngineConfig,
    cancel: watch::Sender<bool>,
}

impl ReservationEngine {
    /// New engine over an AM client
    pub fn new(client: Arc<dyn AmClient>, config: EngineConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            client,
            config,
            cancel,
        }
    }

    /// Abort further scheduling; in-flight RPCs are dropped at their
    /// next suspension point. Aggregates caught mid-allocate re-enter a
    /// later run as Pending.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Run until every aggregate touched by the request has completed.
    pub async fn run(
        &self,
        world: Arc<Mutex<World>>,
        slice: &str,
    ) -> Result<RunReport, StitchError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stats = Arc::new(RunStats::default());
        let mut scs_exclusions: Vec<HopRef> = Vec::new();
        let mut vlan_attempts: BTreeMap<AggregateUrn, u32> = BTreeMap::new();
        let mut dispatched: BTreeSet<AggregateUrn> = BTreeSet::new();
        let mut in_flight: JoinSet<(AggregateUrn, Result<(), StitchError>)> = JoinSet::new();
        let mut cancel_rx = self.cancel.subscribe();

        info!(run = %run_id, slice = %slice, "starting stitching run");

        {
            let mut w = world.lock().await;
            // The cycle check runs before any RPC can be issued.
            deps::build_dependencies(&mut w)?;
            let stale = w.clear_stale_in_process();
            if !stale.is_empty() {
                warn!(run = %run_id, aggregates = ?stale, "reset stale in-process flags");
            }
        }

        let report = loop {
            if *cancel_rx.borrow() {
                in_flight.abort_all();
                return Err(StitchError::Cancelled);
            }

            {
                let w = world.lock().await;
                for urn in w.ready_aggregates() {
                    if dispatched.insert(urn.clone()) {
                        debug!(run = %run_id, aggregate = %urn, "dispatching allocation");
                        in_flight.spawn(allocate(
                            Arc::clone(&world),
                            Arc::clone(&self.client),
                            self.config.clone(),
                            urn,
                            slice.to_string(),
                            Arc::clone(&stats),
                        ));
                    }
                }
                if w.all_completed() && in_flight.is_empty() {
                    break RunReport {
                        run_id,
                        started_at,
                        finished_at: Utc::now(),
                        aggregates_completed: w.rspec.am_urns.len(),
                        reserve_calls: stats.reserve_calls.load(Ordering::Relaxed),
                        delete_calls: stats.delete_calls.load(Ordering::Relaxed),
                        scs_exclusions: scs_exclusions.clone(),
                    };
                }
            }

            if in_flight.is_empty() {
                return Err(StitchError::Internal(
                    "scheduler stalled with incomplete aggregates and no ready work".to_string(),
                ));
            }

            let joined = tokio::select! {
                _ = cancel_rx.changed() => {
                    in_flight.abort_all();
                    return Err(StitchError::Cancelled);
                }
                joined = in_flight.join_next() => joined,
            };

            match joined {
                None => {}
                Some(Ok((urn, Ok(())))) => {
                    dispatched.remove(&urn);
                }
                Some(Ok((urn, Err(err)))) => {
                    dispatched.remove(&urn);
                    match err {
                        StitchError::Rpc {
                            aggregate,
                            source: RpcError::VlanUnavailable(tag),
                        } => {
                            let attempts = vlan_attempts.entry(aggregate.clone()).or_insert(0);
                            *attempts += 1;
                            let excluded =
                                record_vlan_unavailable(&world, &aggregate, tag).await;
                            if *attempts >= self.config.negotiation_max_attempts {
                                in_flight.abort_all();
                                return Err(match excluded.first() {
                                    Some(href) => StitchError::NoFeasibleVlan {
                                        path: href.path.clone(),
                                        hop: hop_id_of(&world, href).await,
                                    },
                                    None => StitchError::Rpc {
                                        aggregate,
                                        source: RpcError::VlanUnavailable(tag),
                                    },
                                });
                            }
                            info!(
                                run = %run_id,
                                aggregate = %aggregate,
                                attempt = *attempts,
                                "VLAN unavailable; re-negotiating"
                            );
                            scs_exclusions.extend(excluded);
                        }
                        fatal => {
                            in_flight.abort_all();
                            return Err(fatal);
                        }
                    }
                }
                Some(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        in_flight.abort_all();
                        return Err(StitchError::Internal(format!(
                            "allocation task failed: {}",
                            join_err
                        )));
                    }
                }
            }
        };

        info!(
            run = %run_id,
            aggregates = report.aggregates_completed,
            reserves = report.reserve_calls,
            deletes = report.delete_calls,
            "stitching run complete"
        );
        Ok(report)
    }

    /// Tear down one aggregate's reservation and invalidate everything
    /// downstream of it. Callers follow with a new [`run`](Self::run) to
    /// re-allocate.
    pub async fn delete_reservation(
        &self,
        world: &Arc<Mutex<World>>,
        urn: &AggregateUrn,
        slice: &str,
    ) -> Result<(), StitchError> {
        let endpoint = {
            let mut w = world.lock().await;
            clear_reservation_state(&mut w, urn)?
        };
        rpc_delete(&*self.client, &self.config, &endpoint, slice).await
    }
}

/// Drop an aggregate's manifest state and un-complete its transitive
/// dependents. Returns the endpoint to send the delete RPC to. The
/// `in_process` flag is left untouched; callers follow with a new
/// allocation.
fn clear_reservation_state(
    world: &mut World,
    urn: &AggregateUrn,
) -> Result<AmEndpoint, StitchError> {
    let (hops, endpoint) = {
        let agg = world
            .aggregate(urn)
            .ok_or_else(|| StitchError::Internal(format!("unknown aggregate {}", urn)))?;
        (agg.hops.clone(), agg.endpoint()?)
    };
    for href in &hops {
        if let Some(hop) = world.hop_mut(href) {
            hop.link.clear_manifest();
        }
    }
    {
        let agg = world.aggregate_mut(urn).expect("aggregate resolved above");
        agg.manifest_doc = None;
        agg.completed = false;
    }
    let downstream = world.transitive_dependents(urn);
    for dep in &downstream {
        if let Some(agg) = world.aggregate_mut(dep) {
            if agg.completed {
                info!(aggregate = %dep, upstream = %urn, "invalidated by upstream teardown");
            }
            agg.completed = false;
        }
    }
    Ok(endpoint)
}

/// One aggregate's allocation: negotiate, optionally tear down a stale
/// manifest, reserve, validate, commit.
async fn allocate(
    world: Arc<Mutex<World>>,
    client: Arc<dyn AmClient>,
    config: EngineConfig,
    urn: AggregateUrn,
    slice: String,
    stats: Arc<RunStats>,
) -> (AggregateUrn, Result<(), StitchError>) {
    let result = allocate_inner(&world, &*client, &config, &urn, &slice, &stats).await;
    (urn, result)
}

async fn allocate_inner(
    world: &Arc<Mutex<World>>,
    client: &dyn AmClient,
    config: &EngineConfig,
    urn: &AggregateUrn,
    slice: &str,
    stats: &RunStats,
) -> Result<(), StitchError> {
    // Negotiate and stage the request under one lock.
    let (endpoint, request, dcn, delete_first) = {
        let mut w = world.lock().await;
        {
            let agg = w
                .aggregate(urn)
                .ok_or_else(|| StitchError::Internal(format!("unknown aggregate {}", urn)))?;
            if agg.in_process || agg.completed {
                warn!(aggregate = %urn, state = %agg.state(), "allocation requested twice; skipping");
                return Ok(());
            }
        }

        let outcome = negotiation::negotiate(&mut w, urn)?;
        let mut delete_first = false;
        if outcome.must_delete {
            clear_reservation_state(&mut w, urn)?;
            delete_first = true;
        } else if outcome.already_done {
            let agg = w.aggregate_mut(urn).expect("aggregate resolved above");
            agg.completed = true;
            info!(aggregate = %urn, "prior manifest still satisfies all hops");
            return Ok(());
        }

        let request = binder::write_request(&w, urn)?;
        let agg = w.aggregate_mut(urn).expect("aggregate resolved above");
        let endpoint = agg.endpoint()?;
        agg.in_process = true;
        agg.request_doc = Some(request.clone());
        (endpoint, request, agg.dcn, delete_first)
    };

    if delete_first {
        stats.delete_calls.fetch_add(1, Ordering::Relaxed);
        rpc_delete(client, config, &endpoint, slice).await?;
    }

    persist_request(config, slice, &endpoint, &request);

    // Reserve, backing off while the AM reports busy.
    let mut attempt = 0u32;
    let manifest = loop {
        attempt += 1;
        stats.reserve_calls.fetch_add(1, Ordering::Relaxed);
        debug!(aggregate = %urn, attempt, op = endpoint.api_version.reserve_op(), "reserve");
        let outcome = timeout(
            config.rpc_timeout,
            client.reserve(&endpoint, slice, &request),
        )
        .await;
        match outcome {
            Err(_) => {
                return Err(StitchError::Rpc {
                    aggregate: urn.clone(),
                    source: RpcError::Timeout,
                })
            }
            Ok(Ok(manifest)) => break manifest,
            Ok(Err(RpcError::Busy)) => {
                if attempt >= config.busy_max_attempts {
                    return Err(StitchError::Rpc {
                        aggregate: urn.clone(),
                        source: RpcError::Busy,
                    });
                }
                let backoff = config.busy_initial_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(aggregate = %urn, attempt, backoff = ?backoff, "aggregate busy; backing off");
                sleep(backoff).await;
            }
            Ok(Err(source)) => {
                return Err(StitchError::Rpc {
                    aggregate: urn.clone(),
                    source,
                })
            }
        }
    };

    if dcn {
        await_sliver_ready(client, config, &endpoint, slice, urn).await?;
    }

    let mut w = world.lock().await;
    commit_manifest(&mut w, urn, &manifest)
}

/// A DCN manifest is provisional until sliver status reports ready.
async fn await_sliver_ready(
    client: &dyn AmClient,
    config: &EngineConfig,
    endpoint: &AmEndpoint,
    slice: &str,
    urn: &AggregateUrn,
) -> Result<(), StitchError> {
    for poll in 1..=config.dcn_poll_max_attempts {
        let status = timeout(config.rpc_timeout, client.sliver_status(endpoint, slice))
            .await
            .map_err(|_| StitchError::Rpc {
                aggregate: urn.clone(),
                source: RpcError::Timeout,
            })?
            .map_err(|source| StitchError::Rpc {
                aggregate: urn.clone(),
                source,
            })?;
        debug!(aggregate = %urn, poll, status = %status, "sliver status");
        match status {
            SliverStatus::Ready => return Ok(()),
            SliverStatus::Failed => {
                return Err(StitchError::Rpc {
                    aggregate: urn.clone(),
                    source: RpcError::Other("sliver provisioning failed".to_string()),
                })
            }
            SliverStatus::Pending => sleep(config.dcn_poll_interval).await,
        }
    }
    Err(StitchError::Rpc {
        aggregate: urn.clone(),
        source: RpcError::Timeout,
    })
}

/// Validate a manifest against what was requested and write the
/// confirmed VLANs into the model.
fn commit_manifest(
    world: &mut World,
    urn: &AggregateUrn,
    manifest: &str,
) -> Result<(), StitchError> {
    let hop_refs = world
        .aggregate(urn)
        .ok_or_else(|| StitchError::Internal(format!("unknown aggregate {}", urn)))?
        .hops
        .clone();

    for href in &hop_refs {
        let (path_id, hop_id, suggested_req) = {
            let hop = world
                .hop(href)
                .ok_or_else(|| StitchError::Internal("dangling hop reference".to_string()))?;
            (
                hop.path.clone(),
                hop.id.clone(),
                hop.link.vlan_suggested_request.clone(),
            )
        };
        let raw = binder::manifest_hop_vlans(manifest, urn, &path_id, &hop_id)?;

        let invalid = |detail: String| StitchError::ManifestInvalid {
            aggregate: urn.clone(),
            hop: hop_id.clone(),
            detail,
        };

        if raw.suggested.is_empty()
            || matches!(raw.suggested.as_str(), "null" | "None" | "any")
        {
            return Err(invalid(format!(
                "suggested VLAN '{}' is not a concrete tag",
                raw.suggested
            )));
        }
        if raw.range.is_empty() {
            return Err(invalid("empty VLAN range availability".to_string()));
        }

        let suggested_range: VlanRange = raw
            .suggested
            .parse()
            .map_err(|e| invalid(format!("unparseable suggested VLAN: {}", e)))?;
        let suggested: VlanId = suggested_range
            .as_single()
            .ok_or_else(|| invalid(format!("suggested VLAN '{}' is not singular", raw.suggested)))?;
        let range: VlanRange = raw
            .range
            .parse()
            .map_err(|e| invalid(format!("unparseable VLAN range: {}", e)))?;
        if range.is_empty() {
            return Err(invalid("empty VLAN range availability".to_string()));
        }
        if !range.contains(suggested) {
            return Err(invalid(format!(
                "suggested VLAN {} is outside the manifested range {}",
                suggested, range
            )));
        }
        if !suggested_range.is_subset_of(&suggested_req) {
            return Err(StitchError::VlanMismatch {
                aggregate: urn.clone(),
                hop: hop_id.clone(),
                requested: suggested_req,
                manifested: suggested_range,
            });
        }

        let hop = world.hop_mut(href).expect("hop resolved above");
        hop.link.vlan_suggested_manifest = Some(suggested);
        hop.link.vlan_range_manifest = Some(range);
        info!(aggregate = %urn, hop = %hop_id, vlan = %suggested, "hop VLAN confirmed");
    }

    let agg = world.aggregate_mut(urn).expect("aggregate resolved above");
    agg.manifest_doc = Some(manifest.to_string());
    agg.completed = true;
    agg.in_process = false;
    info!(aggregate = %urn, state = %agg.state(), "reservation completed");
    Ok(())
}

/// Record a VLAN rejection against the offending hops and return the
/// aggregate to Pending. The hops involved are flagged for exclusion on
/// the next planner round.
async fn record_vlan_unavailable(
    world: &Arc<Mutex<World>>,
    urn: &AggregateUrn,
    tag: Option<VlanId>,
) -> Vec<HopRef> {
    let mut w = world.lock().await;
    let hop_refs = match w.aggregate(urn) {
        Some(agg) => agg.hops.clone(),
        None => return Vec::new(),
    };

    let mut excluded = Vec::new();
    for href in &hop_refs {
        let Some(hop) = w.hop_mut(href) else { continue };
        let rejected = match tag {
            Some(t) if hop.link.vlan_suggested_request.contains(t) => Some(t),
            Some(_) => None,
            // The AM did not name a tag; blame each hop's own suggestion.
            None => hop.link.vlan_suggested_request.as_single(),
        };
        if let Some(t) = rejected {
            hop.vlans_unavailable.add(t);
            hop.loose = true;
            hop.exclude_from_scs = true;
            warn!(aggregate = %urn, hop = %hop.id, vlan = %t, "VLAN marked unavailable");
            excluded.push(href.clone());
        }
    }

    if let Some(agg) = w.aggregate_mut(urn) {
        agg.in_process = false;
        agg.completed = false;
    }
    excluded
}

async fn hop_id_of(world: &Arc<Mutex<World>>, href: &HopRef) -> String {
    let w = world.lock().await;
    w.hop(href)
        .map(|h| h.id.clone())
        .unwrap_or_else(|| href.idx.to_string())
}

async fn rpc_delete(
    client: &dyn AmClient,
    config: &EngineConfig,
    endpoint: &AmEndpoint,
    slice: &str,
) -> Result<(), StitchError> {
    debug!(aggregate = %endpoint.urn, op = endpoint.api_version.delete_op(), "delete");
    timeout(config.rpc_timeout, client.delete(endpoint, slice))
        .await
        .map_err(|_| StitchError::Rpc {
            aggregate: endpoint.urn.clone(),
            source: RpcError::Timeout,
        })?
        .map_err(|source| StitchError::Rpc {
            aggregate: endpoint.urn.clone(),
            source,
        })
}

/// Write the request document under a deterministic audit filename.
/// Failures are logged, never fatal.
fn persist_request(config: &EngineConfig, slice: &str, endpoint: &AmEndpoint, request: &str) {
    let Some(dir) = &config.request_dir else { return };
    let filename = format!(
        "{}-{}-{}-request.xml",
        slice,
        endpoint.urn.slug(),
        endpoint.api_version.reserve_op()
    );
    let path = dir.join(filename);
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create audit directory");
        return;
    }
    match std::fs::write(&path, request) {
        Ok(()) => debug!(file = %path.display(), "request document persisted"),
        Err(e) => warn!(file = %path.display(), error = %e, "cannot persist request document"),
    }
}
