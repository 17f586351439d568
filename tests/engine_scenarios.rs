//! End-to-end scheduler scenarios against the scripted AM

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use stitchnet::adapters::{CallKind, MockAmClient, MockReply};
use stitchnet::{
    read_request, AggregateUrn, AllocationState, EngineConfig, PathId, ReservationEngine,
    SliverStatus, StitchError, VlanId, VlanRange, World,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        rpc_timeout: Duration::from_secs(5),
        busy_initial_backoff: Duration::from_millis(1),
        busy_max_attempts: 3,
        negotiation_max_attempts: 3,
        dcn_poll_interval: Duration::from_millis(1),
        dcn_poll_max_attempts: 5,
        request_dir: None,
    }
}

fn vlan(id: u16) -> VlanId {
    VlanId::try_new(id).unwrap()
}

fn am(auth: &str) -> AggregateUrn {
    AggregateUrn::for_authority(auth)
}

struct HopSpec {
    authority: &'static str,
    range: &'static str,
    suggested: &'static str,
    xlate: bool,
}

impl HopSpec {
    fn new(authority: &'static str, range: &'static str, suggested: &'static str) -> Self {
        Self {
            authority,
            range,
            suggested,
            xlate: false,
        }
    }

    fn translating(mut self) -> Self {
        self.xlate = true;
        self
    }
}

/// Render a request document with one stitched path per entry.
fn request_doc(paths: &[(&str, Vec<HopSpec>)]) -> String {
    let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rspec type=\"request\">\n");
    let mut authorities: Vec<&str> = Vec::new();
    for (_, hops) in paths {
        for hop in hops {
            if !authorities.contains(&hop.authority) {
                authorities.push(hop.authority);
            }
        }
    }
    for auth in &authorities {
        doc.push_str(&format!(
            "  <node client_id=\"host-{auth}\" component_manager_id=\"urn:publicid:IDN+{auth}+authority+cm\"/>\n"
        ));
    }
    for (path_id, hops) in paths {
        doc.push_str(&format!("  <link client_id=\"{path_id}\">\n"));
        for hop in hops {
            doc.push_str(&format!(
                "    <component_manager name=\"urn:publicid:IDN+{}+authority+cm\"/>\n",
                hop.authority
            ));
        }
        doc.push_str("  </link>\n");
    }
    doc.push_str("  <stitching lastUpdateTime=\"2024-03-01T12:00:00Z\">\n");
    for (path_id, hops) in paths {
        doc.push_str(&format!("    <path id=\"{path_id}\">\n"));
        for (i, hop) in hops.iter().enumerate() {
            let hop_id = i + 1;
            let next = if i + 1 < hops.len() {
                format!("{}", i + 2)
            } else {
                "null".to_string()
            };
            doc.push_str(&format!(
                r#"      <hop id="{hop_id}">
        <link id="urn:publicid:IDN+{auth}+interface+sw{hop_id}:p{hop_id}">
          <switchingCapabilityDescriptor>
            <switchingCapabilitySpecificInfo>
              <switchingCapabilitySpecificInfo_L2sc>
                <vlanTranslation>{xlate}</vlanTranslation>
                <vlanRangeAvailability>{range}</vlanRangeAvailability>
                <suggestedVLANRange>{suggested}</suggestedVLANRange>
              </switchingCapabilitySpecificInfo_L2sc>
            </switchingCapabilitySpecificInfo>
          </switchingCapabilityDescriptor>
        </link>
        <nextHop>{next}</nextHop>
      </hop>
"#,
                auth = hop.authority,
                xlate = hop.xlate,
                range = hop.range,
                suggested = hop.suggested,
            ));
        }
        doc.push_str("    </path>\n");
    }
    doc.push_str("  </stitching>\n</rspec>\n");
    doc
}

/// Two hops, AM-A then AM-B, no translation.
fn two_am_request() -> String {
    request_doc(&[(
        "link-ab",
        vec![
            HopSpec::new("am-a.net", "100-105", "any"),
            HopSpec::new("am-b.net", "any", "any"),
        ],
    )])
}

/// Give every interned AM a control URL so the engine can dispatch.
fn configure_endpoints(world: &mut World) {
    let urns: Vec<AggregateUrn> = world.rspec.am_urns.iter().cloned().collect();
    for urn in urns {
        let url = format!("http://{}/am", urn.authority().unwrap_or("unknown"));
        world.aggregate_mut(&urn).unwrap().url = Some(url);
    }
}

async fn bind(request: &str) -> Arc<Mutex<World>> {
    let mut world = read_request(request).unwrap();
    configure_endpoints(&mut world);
    Arc::new(Mutex::new(world))
}

fn hop_manifest(world: &World, path: &str, idx: usize) -> Option<VlanId> {
    world.rspec.stitching.find_path(&PathId::new(path)).unwrap().hops()[idx]
        .link
        .vlan_suggested_manifest
}

#[tokio::test]
async fn two_hop_linear_path_converges_on_one_vlan() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    client.script(
        &am("am-a.net"),
        MockReply::ManifestWith(vec![("1".to_string(), "102".to_string())]),
    );

    let engine = ReservationEngine::new(client.clone(), fast_config());
    let report = engine.run(Arc::clone(&world), "myslice").await.unwrap();

    assert_eq!(report.aggregates_completed, 2);
    assert_eq!(report.reserve_calls, 2);
    assert_eq!(
        client.reserve_order(),
        vec![am("am-a.net"), am("am-b.net")],
        "the producer AM must be reserved before the consumer"
    );

    let w = world.lock().await;
    assert_eq!(hop_manifest(&w, "link-ab", 0), Some(vlan(102)));
    assert_eq!(hop_manifest(&w, "link-ab", 1), Some(vlan(102)));
    for urn in [am("am-a.net"), am("am-b.net")] {
        let agg = w.aggregate(&urn).unwrap();
        assert_eq!(agg.state(), AllocationState::Completed);
        assert!(agg.manifest_doc.is_some());
    }
    w.check_invariants().unwrap();
}

#[tokio::test]
async fn subset_laws_hold_on_completion() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client, fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    let w = world.lock().await;
    for path in w.rspec.stitching.paths() {
        for hop in path.hops() {
            let suggested = hop.link.vlan_suggested_manifest.unwrap();
            let range = hop.link.vlan_range_manifest.clone().unwrap();
            assert!(range.contains(suggested));
            assert!(range.is_subset_of(&hop.link.vlan_range_request));
            assert!(VlanRange::single(suggested).is_subset_of(&range));
        }
    }
}

#[tokio::test]
async fn rerun_on_a_completed_slice_is_a_no_op() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client.clone(), fast_config());

    engine.run(Arc::clone(&world), "myslice").await.unwrap();
    let calls_after_first = client.calls().len();

    let report = engine.run(Arc::clone(&world), "myslice").await.unwrap();
    assert_eq!(report.reserve_calls, 0);
    assert_eq!(report.delete_calls, 0);
    assert_eq!(client.calls().len(), calls_after_first, "no new RPCs on re-entry");
}

#[tokio::test]
async fn vlan_unavailable_is_rerouted_within_the_run() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let a = am("am-a.net");
    client.script(&a, MockReply::VlanUnavailable(vlan(102)));
    client.script(
        &a,
        MockReply::ManifestWith(vec![("1".to_string(), "103".to_string())]),
    );

    let engine = ReservationEngine::new(client.clone(), fast_config());
    let report = engine.run(Arc::clone(&world), "myslice").await.unwrap();

    assert_eq!(client.count(&a, CallKind::Reserve), 2);
    assert!(!report.scs_exclusions.is_empty());

    let w = world.lock().await;
    let first_hop = &w.rspec.stitching.paths()[0].hops()[0];
    assert!(first_hop.vlans_unavailable.contains(vlan(102)));
    assert!(first_hop.loose);
    assert!(first_hop.exclude_from_scs);
    assert_eq!(hop_manifest(&w, "link-ab", 0), Some(vlan(103)));
    assert_eq!(hop_manifest(&w, "link-ab", 1), Some(vlan(103)));
    w.check_invariants().unwrap();
}

#[tokio::test]
async fn upstream_redo_cascades_to_the_consumer() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let a = am("am-a.net");
    let b = am("am-b.net");
    client.script(
        &a,
        MockReply::ManifestWith(vec![("1".to_string(), "102".to_string())]),
    );

    let engine = ReservationEngine::new(client.clone(), fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();
    assert_eq!(hop_manifest(&*world.lock().await, "link-ab", 1), Some(vlan(102)));

    // Tear down the producer and force a different tag on the redo.
    engine
        .delete_reservation(&world, &a, "myslice")
        .await
        .unwrap();
    {
        let w = world.lock().await;
        assert_eq!(w.aggregate(&a).unwrap().state(), AllocationState::Pending);
        assert!(
            !w.aggregate(&b).unwrap().completed,
            "teardown must ripple to every dependent aggregate"
        );
        assert!(w.aggregate(&b).unwrap().manifest_doc.is_some());
    }
    client.script(
        &a,
        MockReply::ManifestWith(vec![("1".to_string(), "104".to_string())]),
    );

    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    // The consumer's stale 102 manifest was deleted and redone at 104.
    assert_eq!(client.count(&b, CallKind::Delete), 1);
    let w = world.lock().await;
    assert_eq!(hop_manifest(&w, "link-ab", 0), Some(vlan(104)));
    assert_eq!(hop_manifest(&w, "link-ab", 1), Some(vlan(104)));
    w.check_invariants().unwrap();
}

#[tokio::test]
async fn translator_blocks_the_import_chain() {
    init_tracing();
    let request = request_doc(&[(
        "link-ab",
        vec![
            HopSpec::new("am-a.net", "100-105", "any").translating(),
            HopSpec::new("am-b.net", "200-210", "any"),
        ],
    )]);
    let world = bind(&request).await;
    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client, fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    let w = world.lock().await;
    let path = &w.rspec.stitching.paths()[0];
    assert!(!path.hops()[1].import_vlans);
    assert!(w.aggregate(&am("am-b.net")).unwrap().depends_on.is_empty());
    // The consumer kept its own request and got a tag from its own range.
    assert_eq!(hop_manifest(&w, "link-ab", 1), Some(vlan(200)));
    assert_eq!(hop_manifest(&w, "link-ab", 0), Some(vlan(100)));
}

#[tokio::test]
async fn busy_aggregate_is_retried_with_backoff() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let a = am("am-a.net");
    client.script(&a, MockReply::Busy);
    client.script(&a, MockReply::Busy);

    let engine = ReservationEngine::new(client.clone(), fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    assert_eq!(client.count(&a, CallKind::Reserve), 3);
    let w = world.lock().await;
    assert_eq!(w.aggregate(&a).unwrap().state(), AllocationState::Completed);
}

#[tokio::test]
async fn busy_beyond_the_bound_is_fatal() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let a = am("am-a.net");
    for _ in 0..4 {
        client.script(&a, MockReply::Busy);
    }

    let engine = ReservationEngine::new(client.clone(), fast_config());
    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::Rpc { .. }));
    assert_eq!(client.count(&a, CallKind::Reserve), 3);
}

#[tokio::test]
async fn dependency_cycle_fails_before_any_rpc() {
    init_tracing();
    let mut world = World::default();
    let a = am("am-a.net");
    let b = am("am-b.net");
    world.aggregate_or_intern(&a).depends_on.insert(b.clone());
    world.aggregate_or_intern(&b).depends_on.insert(a.clone());
    configure_endpoints(&mut world);

    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client.clone(), fast_config());
    let err = engine
        .run(Arc::new(Mutex::new(world)), "myslice")
        .await
        .unwrap_err();

    match err {
        StitchError::Cycle(urns) => assert_eq!(urns, vec![a, b]),
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(client.calls().is_empty(), "no RPC may precede the cycle check");
}

#[tokio::test]
async fn diamond_dependencies_reserve_the_join_last() {
    init_tracing();
    let request = request_doc(&[
        (
            "link-ac",
            vec![
                HopSpec::new("am-a.net", "100-105", "any"),
                HopSpec::new("am-c.net", "any", "any"),
            ],
        ),
        (
            "link-bc",
            vec![
                HopSpec::new("am-b.net", "300-310", "any"),
                HopSpec::new("am-c.net", "any", "any"),
            ],
        ),
    ]);
    let world = bind(&request).await;
    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client.clone(), fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    let order = client.reserve_order();
    assert_eq!(order.len(), 3);
    assert_eq!(
        order.last(),
        Some(&am("am-c.net")),
        "the join aggregate waits for both producers"
    );

    let w = world.lock().await;
    assert_eq!(
        hop_manifest(&w, "link-ac", 0),
        hop_manifest(&w, "link-ac", 1)
    );
    assert_eq!(
        hop_manifest(&w, "link-bc", 0),
        hop_manifest(&w, "link-bc", 1)
    );
    w.check_invariants().unwrap();
}

#[tokio::test]
async fn dcn_aggregate_waits_for_sliver_ready() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let a = am("am-a.net");
    {
        let mut w = world.lock().await;
        w.aggregate_mut(&a).unwrap().dcn = true;
    }
    let client = Arc::new(MockAmClient::new());
    client.script_status(&a, SliverStatus::Pending);
    client.script_status(&a, SliverStatus::Ready);

    let engine = ReservationEngine::new(client.clone(), fast_config());
    engine.run(Arc::clone(&world), "myslice").await.unwrap();

    assert_eq!(client.count(&a, CallKind::Status), 2);
    let w = world.lock().await;
    assert_eq!(w.aggregate(&a).unwrap().state(), AllocationState::Completed);
}

#[tokio::test]
async fn dcn_sliver_failure_is_fatal() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let a = am("am-a.net");
    {
        let mut w = world.lock().await;
        w.aggregate_mut(&a).unwrap().dcn = true;
    }
    let client = Arc::new(MockAmClient::new());
    client.script_status(&a, SliverStatus::Failed);

    let engine = ReservationEngine::new(client, fast_config());
    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::Rpc { .. }));
}

#[tokio::test]
async fn manifest_suggesting_any_is_rejected() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    client.script(
        &am("am-a.net"),
        MockReply::ManifestWith(vec![("1".to_string(), "any".to_string())]),
    );

    let engine = ReservationEngine::new(client, fast_config());
    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::ManifestInvalid { .. }));
}

#[tokio::test]
async fn manifest_outside_the_requested_suggestion_is_a_mismatch() {
    init_tracing();
    let request = request_doc(&[(
        "link-ab",
        vec![
            HopSpec::new("am-a.net", "100-105", "102"),
            HopSpec::new("am-b.net", "any", "any"),
        ],
    )]);
    let world = bind(&request).await;
    let client = Arc::new(MockAmClient::new());
    client.script(
        &am("am-a.net"),
        MockReply::ManifestWith(vec![("1".to_string(), "103".to_string())]),
    );

    let engine = ReservationEngine::new(client, fast_config());
    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::VlanMismatch { .. }));
}

#[tokio::test]
async fn exhausted_vlan_candidates_end_the_run() {
    init_tracing();
    let request = request_doc(&[(
        "link-ab",
        vec![
            HopSpec::new("am-a.net", "100", "100"),
            HopSpec::new("am-b.net", "any", "any"),
        ],
    )]);
    let world = bind(&request).await;
    let client = Arc::new(MockAmClient::new());
    client.script(&am("am-a.net"), MockReply::VlanUnavailable(vlan(100)));

    let engine = ReservationEngine::new(client, fast_config());
    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::NoFeasibleVlan { .. }));
}

#[tokio::test]
async fn cancelled_engine_issues_no_rpcs() {
    init_tracing();
    let world = bind(&two_am_request()).await;
    let client = Arc::new(MockAmClient::new());
    let engine = ReservationEngine::new(client.clone(), fast_config());
    engine.cancel();

    let err = engine.run(Arc::clone(&world), "myslice").await.unwrap_err();
    assert!(matches!(err, StitchError::Cancelled));
    assert!(client.calls().is_empty());
}
