//! Request-document binding: parse into the model, emit per-AM documents

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node as XmlNode};

use crate::domain::value_objects::urn_authority;
use crate::domain::{
    AggregateUrn, Hop, HopLink, InterfaceRef, Link, Node, Path, PathId, RSpec, StitchError,
    Stitching, VlanRange, World,
};

// XML names
const RSPEC_TAG: &str = "rspec";
const NODE_TAG: &str = "node";
const LINK_TAG: &str = "link";
const STITCHING_TAG: &str = "stitching";
const PATH_TAG: &str = "path";
const HOP_TAG: &str = "hop";
const NEXT_HOP_TAG: &str = "nextHop";
const COMPONENT_MANAGER_TAG: &str = "component_manager";
const INTERFACE_REF_TAG: &str = "interface_ref";
const SHARED_VLAN_TAG: &str = "link_shared_vlan";
const SCD_TAG: &str = "switchingCapabilityDescriptor";
const SCSI_TAG: &str = "switchingCapabilitySpecificInfo";
const SCSI_L2SC_TAG: &str = "switchingCapabilitySpecificInfo_L2sc";
const VLAN_TRANSLATION_TAG: &str = "vlanTranslation";
const VLAN_RANGE_TAG: &str = "vlanRangeAvailability";
const VLAN_SUGGESTED_TAG: &str = "suggestedVLANRange";
const CLIENT_ID_ATTR: &str = "client_id";
const COMPONENT_MANAGER_ID_ATTR: &str = "component_manager_id";
const NAME_ATTR: &str = "name";
const ID_ATTR: &str = "id";
const TYPE_ATTR: &str = "type";
const LAST_UPDATE_ATTR: &str = "lastUpdateTime";
const LOOSE_TYPE: &str = "loose";

/// Parse an abstract request document into a freshly bound [`World`].
///
/// Main-body nodes and links intern their component managers as
/// user-requested aggregates; stitching hops are attached to the AM that
/// owns their link URN's authority.
pub fn read_request(xml: &str) -> Result<World, StitchError> {
    let doc = Document::parse(xml).map_err(|e| StitchError::Parse(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != RSPEC_TAG {
        return Err(StitchError::Parse(format!(
            "expected <{}> document root, found <{}>",
            RSPEC_TAG,
            root.tag_name().name()
        )));
    }

    let mut world = World::new(RSpec {
        document: xml.to_string(),
        ..RSpec::default()
    });

    let mut stitching_elem = None;
    for child in root.children().filter(XmlNode::is_element) {
        match child.tag_name().name() {
            NODE_TAG => {
                let node = read_node(&child, &mut world)?;
                world.rspec.nodes.push(node);
            }
            LINK_TAG => {
                let link = read_link(&child, &mut world)?;
                world.rspec.links.push(link);
            }
            STITCHING_TAG => stitching_elem = Some(child),
            _ => {}
        }
    }

    if let Some(elem) = stitching_elem {
        let mut stitching =
            Stitching::new(elem.attribute(LAST_UPDATE_ATTR).map(str::to_string));
        for path_elem in elem
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == PATH_TAG)
        {
            let path = read_path(&path_elem, &mut world)?;
            stitching.push_path(path);
        }
        world.rspec.stitching = stitching;
    }

    register_hops(&mut world);
    Ok(world)
}

fn read_node(elem: &XmlNode, world: &mut World) -> Result<Node, StitchError> {
    let client_id = required_attr(elem, CLIENT_ID_ATTR)?;
    let component_manager = elem
        .attribute(COMPONENT_MANAGER_ID_ATTR)
        .map(AggregateUrn::new);
    if let Some(urn) = &component_manager {
        world.aggregate_or_intern(urn).user_requested = true;
    }
    Ok(Node {
        client_id,
        component_manager,
    })
}

fn read_link(elem: &XmlNode, world: &mut World) -> Result<Link, StitchError> {
    let client_id = required_attr(elem, CLIENT_ID_ATTR)?;
    let mut aggregates = Vec::new();
    let mut interfaces = Vec::new();
    let mut has_shared_vlan = false;
    for child in elem.children().filter(XmlNode::is_element) {
        match child.tag_name().name() {
            COMPONENT_MANAGER_TAG => {
                let urn = AggregateUrn::new(required_attr(&child, NAME_ATTR)?);
                world.aggregate_or_intern(&urn).user_requested = true;
                aggregates.push(urn);
            }
            INTERFACE_REF_TAG => {
                interfaces.push(InterfaceRef {
                    client_id: required_attr(&child, CLIENT_ID_ATTR)?,
                });
            }
            SHARED_VLAN_TAG => has_shared_vlan = true,
            _ => {}
        }
    }
    Ok(Link {
        client_id,
        aggregates,
        interfaces,
        has_shared_vlan,
    })
}

fn read_path(elem: &XmlNode, world: &mut World) -> Result<Path, StitchError> {
    let id = PathId::new(required_attr(elem, ID_ATTR)?);
    let mut path = Path::new(id.clone());
    let mut next_ids = Vec::new();

    for hop_elem in elem
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == HOP_TAG)
    {
        let (hop, next_id) = read_hop(&hop_elem, &id, world)?;
        next_ids.push(next_id);
        path.push(hop);
    }

    // Resolve the nextHop ids now that every hop on the path is known.
    let targets: Vec<Option<usize>> = next_ids
        .iter()
        .map(|next| match next {
            Some(id) => match path.find_hop(id) {
                Some(hop) => Ok(Some(hop.idx)),
                None => Err(StitchError::Parse(format!(
                    "nextHop '{}' names no hop on path {}",
                    id,
                    path.id()
                ))),
            },
            None => Ok(None),
        })
        .collect::<Result<_, _>>()?;
    for (hop, target) in path.hops_mut().iter_mut().zip(targets) {
        hop.next_hop = target;
    }
    path.validate()?;
    Ok(path)
}

fn read_hop(
    elem: &XmlNode,
    path_id: &PathId,
    world: &mut World,
) -> Result<(Hop, Option<String>), StitchError> {
    let id = required_attr(elem, ID_ATTR)?;
    let loose = elem.attribute(TYPE_ATTR) == Some(LOOSE_TYPE);

    let link_elem = child_element(elem, LINK_TAG).ok_or_else(|| {
        StitchError::Parse(format!("hop {} on path {} has no <link>", id, path_id))
    })?;
    let link = read_hop_link(&link_elem)?;

    let next_id = child_element(elem, NEXT_HOP_TAG)
        .and_then(|n| n.text().map(str::trim).map(str::to_string))
        .filter(|t| !t.is_empty() && t != "null");

    let aggregate = aggregate_for_link(&link.urn, world)?;
    let mut hop = Hop::new(id, link, aggregate);
    hop.loose = loose;
    Ok((hop, next_id))
}

fn read_hop_link(elem: &XmlNode) -> Result<HopLink, StitchError> {
    let urn = required_attr(elem, ID_ATTR)?;
    let mut link = HopLink::new(urn);

    if let Some(text) = descendant_text(elem, VLAN_TRANSLATION_TAG) {
        link.vlan_xlate = text.eq_ignore_ascii_case("true");
    }
    // Missing or empty availability/suggestion text means "any".
    link.vlan_range_request = descendant_text(elem, VLAN_RANGE_TAG)
        .unwrap_or_default()
        .parse::<VlanRange>()?;
    link.vlan_suggested_request = descendant_text(elem, VLAN_SUGGESTED_TAG)
        .unwrap_or_default()
        .parse::<VlanRange>()?;
    Ok(link)
}

/// The AM owning a hop link: an already-interned aggregate whose URN
/// carries the same authority wins; otherwise the conventional AM URN
/// for that authority is interned.
fn aggregate_for_link(link_urn: &str, world: &mut World) -> Result<AggregateUrn, StitchError> {
    let authority = urn_authority(link_urn)
        .ok_or_else(|| {
            StitchError::Parse(format!("hop link URN '{}' has no authority", link_urn))
        })?
        .to_string();
    let known = world
        .aggregates()
        .find(|a| a.urn.authority() == Some(authority.as_str()))
        .map(|a| a.urn.clone());
    let urn = known.unwrap_or_else(|| AggregateUrn::for_authority(&authority));
    world.aggregate_or_intern(&urn);
    Ok(urn)
}

/// Attach every hop to its owning aggregate's bookkeeping.
fn register_hops(world: &mut World) {
    let mut memberships = Vec::new();
    for path in world.rspec.stitching.paths() {
        for hop in path.hops() {
            memberships.push((hop.aggregate.clone(), hop.href(), path.id().clone()));
        }
    }
    for (urn, href, path_id) in memberships {
        let agg = world.aggregate_or_intern(&urn);
        if !agg.hops.contains(&href) {
            agg.hops.push(href);
        }
        agg.paths.insert(path_id);
    }
}

fn required_attr(elem: &XmlNode, name: &str) -> Result<String, StitchError> {
    elem.attribute(name).map(str::to_string).ok_or_else(|| {
        StitchError::Parse(format!(
            "<{}> is missing the '{}' attribute",
            elem.tag_name().name(),
            name
        ))
    })
}

fn child_element<'a, 'input>(
    elem: &XmlNode<'a, 'input>,
    name: &str,
) -> Option<XmlNode<'a, 'input>> {
    elem.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn descendant_text<'a>(elem: &XmlNode<'a, '_>, name: &str) -> Option<&'a str> {
    elem.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::trim)
}

/// Render the request document for one aggregate from the current model.
///
/// Every hop emits its present `vlan_*_request` values, so a document
/// built after negotiation carries exactly what the engine decided to
/// ask for.
pub fn write_request(world: &World, aggregate: &AggregateUrn) -> Result<String, StitchError> {
    tracing::debug!(aggregate = %aggregate, "rendering request document");
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(write_err)?;

    let mut rspec = BytesStart::new(RSPEC_TAG);
    rspec.push_attribute(("type", "request"));
    writer.write_event(Event::Start(rspec)).map_err(write_err)?;

    for node in &world.rspec.nodes {
        let mut elem = BytesStart::new(NODE_TAG);
        elem.push_attribute((CLIENT_ID_ATTR, node.client_id.as_str()));
        if let Some(cm) = &node.component_manager {
            elem.push_attribute((COMPONENT_MANAGER_ID_ATTR, cm.as_str()));
        }
        writer.write_event(Event::Empty(elem)).map_err(write_err)?;
    }

    for link in &world.rspec.links {
        let mut elem = BytesStart::new(LINK_TAG);
        elem.push_attribute((CLIENT_ID_ATTR, link.client_id.as_str()));
        writer.write_event(Event::Start(elem)).map_err(write_err)?;
        for cm in &link.aggregates {
            let mut elem = BytesStart::new(COMPONENT_MANAGER_TAG);
            elem.push_attribute((NAME_ATTR, cm.as_str()));
            writer.write_event(Event::Empty(elem)).map_err(write_err)?;
        }
        for iface in &link.interfaces {
            let mut elem = BytesStart::new(INTERFACE_REF_TAG);
            elem.push_attribute((CLIENT_ID_ATTR, iface.client_id.as_str()));
            writer.write_event(Event::Empty(elem)).map_err(write_err)?;
        }
        if link.has_shared_vlan {
            writer
                .write_event(Event::Empty(BytesStart::new(SHARED_VLAN_TAG)))
                .map_err(write_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(LINK_TAG)))
            .map_err(write_err)?;
    }

    let mut stitching = BytesStart::new(STITCHING_TAG);
    if let Some(stamp) = &world.rspec.stitching.last_update {
        stitching.push_attribute((LAST_UPDATE_ATTR, stamp.as_str()));
    }
    writer
        .write_event(Event::Start(stitching))
        .map_err(write_err)?;

    for path in world.rspec.stitching.paths() {
        let mut elem = BytesStart::new(PATH_TAG);
        elem.push_attribute((ID_ATTR, path.id().as_str()));
        writer.write_event(Event::Start(elem)).map_err(write_err)?;
        for hop in path.hops() {
            write_hop(&mut writer, hop, path.hops())?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(PATH_TAG)))
            .map_err(write_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(STITCHING_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(RSPEC_TAG)))
        .map_err(write_err)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| StitchError::Internal(format!("request document is not UTF-8: {}", e)))
}

fn write_hop(
    writer: &mut Writer<Vec<u8>>,
    hop: &Hop,
    siblings: &[Hop],
) -> Result<(), StitchError> {
    let mut elem = BytesStart::new(HOP_TAG);
    elem.push_attribute((ID_ATTR, hop.id.as_str()));
    if hop.loose {
        elem.push_attribute((TYPE_ATTR, LOOSE_TYPE));
    }
    writer.write_event(Event::Start(elem)).map_err(write_err)?;

    let mut link = BytesStart::new(LINK_TAG);
    link.push_attribute((ID_ATTR, hop.link.urn.as_str()));
    writer.write_event(Event::Start(link)).map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new(SCD_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new(SCSI_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new(SCSI_L2SC_TAG)))
        .map_err(write_err)?;

    write_text_element(
        writer,
        VLAN_TRANSLATION_TAG,
        if hop.link.vlan_xlate { "true" } else { "false" },
    )?;
    write_text_element(
        writer,
        VLAN_RANGE_TAG,
        &hop.link.vlan_range_request.to_string(),
    )?;
    write_text_element(
        writer,
        VLAN_SUGGESTED_TAG,
        &hop.link.vlan_suggested_request.to_string(),
    )?;

    writer
        .write_event(Event::End(BytesEnd::new(SCSI_L2SC_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(SCSI_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(SCD_TAG)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(LINK_TAG)))
        .map_err(write_err)?;

    let next_text = hop
        .next_hop
        .and_then(|idx| siblings.get(idx))
        .map(|h| h.id.clone())
        .unwrap_or_else(|| "null".to_string());
    write_text_element(writer, NEXT_HOP_TAG, &next_text)?;

    writer
        .write_event(Event::End(BytesEnd::new(HOP_TAG)))
        .map_err(write_err)
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), StitchError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(write_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(write_err)
}

fn write_err(err: quick_xml::Error) -> StitchError {
    StitchError::Internal(format!("failed to write request document: {}", err))
}
