//! Scripted in-memory aggregate manager
//!
//! The test suite's AM: replies are queued per aggregate and a full call
//! log supports ordering assertions. The default behavior answers every
//! reservation with a manifest that echoes the request, picking the
//! first legal tag wherever the request left the suggestion open.

use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node as XmlNode};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::domain::{AggregateUrn, AmClient, AmEndpoint, RpcError, SliverStatus, VlanId, VlanRange};

/// One scripted reply to a reserve call
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Manifest echoing the request, first legal tag where open
    Manifest,
    /// Manifest with raw suggested-VLAN text overrides keyed by hop id
    ManifestWith(Vec<(String, String)>),
    /// AM reports busy
    Busy,
    /// AM rejects the named VLAN
    VlanUnavailable(VlanId),
    /// AM fails outright
    Fail(String),
}

/// What kind of call a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A reservation RPC
    Reserve,
    /// A teardown RPC
    Delete,
    /// A sliver-status poll
    Status,
}

/// One entry in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// The aggregate that was called
    pub aggregate: AggregateUrn,
    /// What was called
    pub kind: CallKind,
}

/// Scripted AM client
#[derive(Default)]
pub struct MockAmClient {
    replies: Mutex<BTreeMap<AggregateUrn, VecDeque<MockReply>>>,
    statuses: Mutex<BTreeMap<AggregateUrn, VecDeque<SliverStatus>>>,
    log: Mutex<Vec<CallRecord>>,
}

impl MockAmClient {
    /// New mock with no scripts; every reserve echoes a manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reserve reply for an aggregate
    pub fn script(&self, urn: &AggregateUrn, reply: MockReply) {
        lock(&self.replies)
            .entry(urn.clone())
            .or_default()
            .push_back(reply);
    }

    /// Queue one sliver-status reply for an aggregate
    pub fn script_status(&self, urn: &AggregateUrn, status: SliverStatus) {
        lock(&self.statuses)
            .entry(urn.clone())
            .or_default()
            .push_back(status);
    }

    /// Snapshot of every call made so far, in order
    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.log).clone()
    }

    /// Aggregates that received a reserve call, in call order
    pub fn reserve_order(&self) -> Vec<AggregateUrn> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Reserve)
            .map(|c| c.aggregate)
            .collect()
    }

    /// Number of calls of one kind made to one aggregate
    pub fn count(&self, urn: &AggregateUrn, kind: CallKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == kind && &c.aggregate == urn)
            .count()
    }

    fn record(&self, urn: &AggregateUrn, kind: CallKind) {
        lock(&self.log).push(CallRecord {
            aggregate: urn.clone(),
            kind,
        });
    }

    fn next_reply(&self, urn: &AggregateUrn) -> MockReply {
        lock(&self.replies)
            .get_mut(urn)
            .and_then(VecDeque::pop_front)
            .unwrap_or(MockReply::Manifest)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AmClient for MockAmClient {
    async fn reserve(
        &self,
        endpoint: &AmEndpoint,
        _slice: &str,
        request: &str,
    ) -> Result<String, RpcError> {
        self.record(&endpoint.urn, CallKind::Reserve);
        match self.next_reply(&endpoint.urn) {
            MockReply::Manifest => manifest_for(request, &[]),
            MockReply::ManifestWith(overrides) => manifest_for(request, &overrides),
            MockReply::Busy => Err(RpcError::Busy),
            MockReply::VlanUnavailable(vlan) => Err(RpcError::VlanUnavailable(Some(vlan))),
            MockReply::Fail(detail) => Err(RpcError::Other(detail)),
        }
    }

    async fn delete(&self, endpoint: &AmEndpoint, _slice: &str) -> Result<(), RpcError> {
        self.record(&endpoint.urn, CallKind::Delete);
        Ok(())
    }

    async fn sliver_status(
        &self,
        endpoint: &AmEndpoint,
        _slice: &str,
    ) -> Result<SliverStatus, RpcError> {
        self.record(&endpoint.urn, CallKind::Status);
        let status = lock(&self.statuses)
            .get_mut(&endpoint.urn)
            .and_then(VecDeque::pop_front)
            .unwrap_or(SliverStatus::Ready);
        Ok(status)
    }
}

/// Build a manifest answering `request`: every hop keeps its availability
/// range and gets a concrete suggestion.
fn manifest_for(request: &str, overrides: &[(String, String)]) -> Result<String, RpcError> {
    let doc = Document::parse(request)
        .map_err(|e| RpcError::Malformed(format!("unparseable request: {}", e)))?;
    let stitching = doc
        .root_element()
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "stitching")
        .ok_or_else(|| RpcError::Malformed("request has no stitching section".to_string()))?;

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    write_ev(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut rspec = BytesStart::new("rspec");
    rspec.push_attribute(("type", "manifest"));
    write_ev(&mut writer, Event::Start(rspec))?;
    write_ev(&mut writer, Event::Start(BytesStart::new("stitching")))?;

    for path in stitching
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "path")
    {
        let path_id = path.attribute("id").unwrap_or_default();
        let mut path_elem = BytesStart::new("path");
        path_elem.push_attribute(("id", path_id));
        write_ev(&mut writer, Event::Start(path_elem))?;

        for hop in path
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "hop")
        {
            let hop_id = hop.attribute("id").unwrap_or_default();
            let range_text = descendant_text(&hop, "vlanRangeAvailability").unwrap_or("any");
            let suggested_text = descendant_text(&hop, "suggestedVLANRange").unwrap_or("any");
            let link_urn = hop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "link")
                .and_then(|l| l.attribute("id"))
                .unwrap_or_default();

            let suggested = match overrides.iter().find(|(id, _)| id == hop_id) {
                Some((_, text)) => text.clone(),
                None => pick_suggested(range_text, suggested_text)?,
            };

            let mut hop_elem = BytesStart::new("hop");
            hop_elem.push_attribute(("id", hop_id));
            write_ev(&mut writer, Event::Start(hop_elem))?;
            let mut link_elem = BytesStart::new("link");
            link_elem.push_attribute(("id", link_urn));
            write_ev(&mut writer, Event::Start(link_elem))?;
            write_ev(
                &mut writer,
                Event::Start(BytesStart::new("switchingCapabilityDescriptor")),
            )?;
            write_ev(
                &mut writer,
                Event::Start(BytesStart::new("switchingCapabilitySpecificInfo")),
            )?;
            write_ev(
                &mut writer,
                Event::Start(BytesStart::new("switchingCapabilitySpecificInfo_L2sc")),
            )?;
            write_ev(
                &mut writer,
                Event::Start(BytesStart::new("vlanRangeAvailability")),
            )?;
            write_ev(&mut writer, Event::Text(BytesText::new(range_text)))?;
            write_ev(
                &mut writer,
                Event::End(BytesEnd::new("vlanRangeAvailability")),
            )?;
            write_ev(
                &mut writer,
                Event::Start(BytesStart::new("suggestedVLANRange")),
            )?;
            write_ev(&mut writer, Event::Text(BytesText::new(&suggested)))?;
            write_ev(&mut writer, Event::End(BytesEnd::new("suggestedVLANRange")))?;
            write_ev(
                &mut writer,
                Event::End(BytesEnd::new("switchingCapabilitySpecificInfo_L2sc")),
            )?;
            write_ev(
                &mut writer,
                Event::End(BytesEnd::new("switchingCapabilitySpecificInfo")),
            )?;
            write_ev(
                &mut writer,
                Event::End(BytesEnd::new("switchingCapabilityDescriptor")),
            )?;
            write_ev(&mut writer, Event::End(BytesEnd::new("link")))?;
            write_ev(&mut writer, Event::End(BytesEnd::new("hop")))?;
        }

        write_ev(&mut writer, Event::End(BytesEnd::new("path")))?;
    }

    write_ev(&mut writer, Event::End(BytesEnd::new("stitching")))?;
    write_ev(&mut writer, Event::End(BytesEnd::new("rspec")))?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| RpcError::Other(format!("manifest is not UTF-8: {}", e)))
}

/// The request's suggestion when it is already concrete, otherwise the
/// first tag that is both available and permitted.
fn pick_suggested(range_text: &str, suggested_text: &str) -> Result<String, RpcError> {
    let suggested: VlanRange = suggested_text
        .parse()
        .map_err(|e| RpcError::Malformed(format!("bad suggested range: {}", e)))?;
    if let Some(tag) = suggested.as_single() {
        return Ok(tag.to_string());
    }
    let range: VlanRange = range_text
        .parse()
        .map_err(|e| RpcError::Malformed(format!("bad availability range: {}", e)))?;
    range
        .intersect(&suggested)
        .first()
        .map(|t| t.to_string())
        .ok_or_else(|| RpcError::Other("no pickable VLAN in request".to_string()))
}

fn write_ev(w: &mut Writer<Vec<u8>>, e: Event<'_>) -> Result<(), RpcError> {
    w.write_event(e)
        .map_err(|err| RpcError::Other(format!("manifest write failed: {}", err)))
}

fn descendant_text<'a>(node: &XmlNode<'a, '_>, name: &str) -> Option<&'a str> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
