//! Manifest-document binding: extract the VLANs an AM confirmed

use roxmltree::{Document, Node as XmlNode};

use crate::domain::{AggregateUrn, PathId, StitchError};

/// Raw VLAN text confirmed for one hop, before semantic validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHopVlans {
    /// `suggestedVLANRange` text, trimmed
    pub suggested: String,
    /// `vlanRangeAvailability` text, trimmed
    pub range: String,
}

/// Extract the confirmed VLANs for one hop from an AM manifest.
///
/// Descends rspec → stitching → path → hop → link →
/// switchingCapabilityDescriptor → switchingCapabilitySpecificInfo →
/// (L2sc) → the two VLAN elements. Any missing step fails with
/// [`StitchError::ManifestMalformed`] naming that step.
pub fn manifest_hop_vlans(
    xml: &str,
    aggregate: &AggregateUrn,
    path: &PathId,
    hop_id: &str,
) -> Result<RawHopVlans, StitchError> {
    let malformed = |detail: String| StitchError::ManifestMalformed {
        aggregate: aggregate.clone(),
        hop: hop_id.to_string(),
        detail,
    };

    let doc = Document::parse(xml).map_err(|e| malformed(format!("unparseable XML: {}", e)))?;
    let root = doc.root_element();
    if root.tag_name().name() != "rspec" {
        return Err(malformed(format!(
            "document root is <{}>, not <rspec>",
            root.tag_name().name()
        )));
    }

    let stitching = child_named(&root, "stitching")
        .ok_or_else(|| malformed("no <stitching> section".to_string()))?;
    let path_elem = stitching
        .children()
        .filter(XmlNode::is_element)
        .find(|n| n.tag_name().name() == "path" && n.attribute("id") == Some(path.as_str()))
        .ok_or_else(|| malformed(format!("no <path id=\"{}\">", path)))?;
    let hop_elem = path_elem
        .children()
        .filter(XmlNode::is_element)
        .find(|n| n.tag_name().name() == "hop" && n.attribute("id") == Some(hop_id))
        .ok_or_else(|| malformed(format!("no <hop id=\"{}\">", hop_id)))?;
    let link = child_named(&hop_elem, "link").ok_or_else(|| malformed("no <link>".to_string()))?;
    let descriptor = child_named(&link, "switchingCapabilityDescriptor")
        .ok_or_else(|| malformed("no <switchingCapabilityDescriptor>".to_string()))?;
    let info = child_named(&descriptor, "switchingCapabilitySpecificInfo")
        .ok_or_else(|| malformed("no <switchingCapabilitySpecificInfo>".to_string()))?;
    // The L2sc wrapper is optional in manifests seen in the wild; the
    // VLAN elements may sit directly under the specific-info element.
    let vlan_parent =
        child_named(&info, "switchingCapabilitySpecificInfo_L2sc").unwrap_or(info);

    let range = text_of(&vlan_parent, "vlanRangeAvailability")
        .ok_or_else(|| malformed("no <vlanRangeAvailability>".to_string()))?;
    let suggested = text_of(&vlan_parent, "suggestedVLANRange")
        .ok_or_else(|| malformed("no <suggestedVLANRange>".to_string()))?;

    Ok(RawHopVlans { suggested, range })
}

fn child_named<'a, 'input>(
    elem: &XmlNode<'a, 'input>,
    name: &str,
) -> Option<XmlNode<'a, 'input>> {
    elem.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text_of(elem: &XmlNode, name: &str) -> Option<String> {
    child_named(elem, name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
}
