//! Value objects for the stitching domain

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lowest valid VLAN tag.
pub const VLAN_MIN: u16 = 1;
/// Highest valid VLAN tag.
pub const VLAN_MAX: u16 = 4094;

/// VLAN ID (1-4094, excluding reserved)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VlanId(u16);

#[derive(Error, Debug)]
pub enum VlanIdError {
    #[error("VLAN ID {0} is reserved")]
    Reserved(u16),
    #[error("VLAN ID {0} is out of range (must be 1-4094)")]
    OutOfRange(u16),
}

impl VlanId {
    /// Create a new VLAN ID with validation
    pub fn try_new(id: u16) -> Result<Self, VlanIdError> {
        match id {
            0 => Err(VlanIdError::Reserved(id)),
            4095 => Err(VlanIdError::Reserved(id)),
            1..=4094 => Ok(Self(id)),
            _ => Err(VlanIdError::OutOfRange(id)),
        }
    }

    /// Get the inner value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while parsing a VLAN range expression
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VlanRangeParseError {
    #[error("invalid VLAN range item '{0}'")]
    InvalidItem(String),
    #[error("VLAN {0} is out of range (must be 1-4094)")]
    OutOfRange(u16),
    #[error("descending VLAN run {0}-{1}")]
    DescendingRun(u16, u16),
}

/// A finite set of VLAN tags in [1, 4094].
///
/// Parsed from comma/dash-list expressions ("1,3-5"); the literal "any"
/// (or an empty expression) denotes the full range. Serialization always
/// emits the minimal comma-separated list of dash-runs, so "any" prints
/// as "1-4094".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VlanRange(BTreeSet<u16>);

impl VlanRange {
    /// The empty set
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// The full [1, 4094] range
    pub fn any() -> Self {
        Self((VLAN_MIN..=VLAN_MAX).collect())
    }

    /// A singleton range
    pub fn single(vlan: VlanId) -> Self {
        let mut set = BTreeSet::new();
        set.insert(vlan.value());
        Self(set)
    }

    /// Set union
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Set intersection
    pub fn intersect(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Set difference (`self - other`)
    pub fn subtract(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Membership test
    pub fn contains(&self, vlan: VlanId) -> bool {
        self.0.contains(&vlan.value())
    }

    /// Subset test (`self ⊆ other`)
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Emptiness test
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tags in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Smallest tag in the set
    pub fn first(&self) -> Option<VlanId> {
        self.0.iter().next().map(|&v| VlanId(v))
    }

    /// The tag if this is a singleton set
    pub fn as_single(&self) -> Option<VlanId> {
        if self.0.len() == 1 {
            self.first()
        } else {
            None
        }
    }

    /// Add one tag to the set
    pub fn add(&mut self, vlan: VlanId) {
        self.0.insert(vlan.value());
    }

    /// Iterate tags in ascending order
    pub fn iter(&self) -> impl Iterator<Item = VlanId> + '_ {
        self.0.iter().map(|&v| VlanId(v))
    }
}

impl FromStr for VlanRange {
    type Err = VlanRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            return Ok(Self::any());
        }

        let mut set = BTreeSet::new();
        for item in trimmed.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(VlanRangeParseError::InvalidItem(item.to_string()));
            }
            match item.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_tag(lo)?;
                    let hi = parse_tag(hi)?;
                    if lo > hi {
                        return Err(VlanRangeParseError::DescendingRun(lo, hi));
                    }
                    set.extend(lo..=hi);
                }
                None => {
                    set.insert(parse_tag(item)?);
                }
            }
        }
        Ok(Self(set))
    }
}

fn parse_tag(s: &str) -> Result<u16, VlanRangeParseError> {
    let tag: u16 = s
        .trim()
        .parse()
        .map_err(|_| VlanRangeParseError::InvalidItem(s.trim().to_string()))?;
    if !(VLAN_MIN..=VLAN_MAX).contains(&tag) {
        return Err(VlanRangeParseError::OutOfRange(tag));
    }
    Ok(tag)
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// URN identifying an aggregate manager
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateUrn(String);

impl AggregateUrn {
    /// Wrap a raw URN string
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    /// The conventional AM URN for an authority ("urn:publicid:IDN+<auth>+authority+cm")
    pub fn for_authority(authority: &str) -> Self {
        Self(format!("urn:publicid:IDN+{}+authority+cm", authority))
    }

    /// The authority component of the URN, if present
    pub fn authority(&self) -> Option<&str> {
        urn_authority(&self.0)
    }

    /// Get the raw URN
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendition of the URN for audit filenames
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.0.len());
        let mut last_dash = false;
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || c == '.' {
                slug.push(c);
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        slug.trim_matches('-').to_string()
    }
}

impl fmt::Display for AggregateUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authority component of a publicid URN ("urn:publicid:IDN+<auth>+...")
pub fn urn_authority(urn: &str) -> Option<&str> {
    let mut parts = urn.split('+');
    parts.next()?;
    let authority = parts.next()?;
    // An authority may carry sub-authorities ("emulab.net:shared"); the
    // top-level name is what identifies the AM.
    let top = authority.split(':').next().unwrap_or(authority);
    if top.is_empty() {
        None
    } else {
        Some(top)
    }
}

/// Identifier of a stitching path (the client_id of the stitched link)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(String);

impl PathId {
    /// Wrap a raw path id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vlan(id: u16) -> VlanId {
        VlanId::try_new(id).unwrap()
    }

    #[test]
    fn vlan_id_validation() {
        assert!(VlanId::try_new(1).is_ok());
        assert!(VlanId::try_new(4094).is_ok());
        assert!(matches!(VlanId::try_new(0), Err(VlanIdError::Reserved(0))));
        assert!(matches!(
            VlanId::try_new(4095),
            Err(VlanIdError::Reserved(4095))
        ));
        assert!(matches!(
            VlanId::try_new(5000),
            Err(VlanIdError::OutOfRange(5000))
        ));
    }

    #[test]
    fn parse_list_and_runs() {
        let range: VlanRange = "1,3-5".parse().unwrap();
        assert_eq!(range.len(), 4);
        assert!(range.contains(vlan(1)));
        assert!(!range.contains(vlan(2)));
        assert!(range.contains(vlan(4)));
        assert_eq!(range.to_string(), "1,3-5");
    }

    #[test]
    fn parse_any_is_full_range() {
        let range: VlanRange = "any".parse().unwrap();
        assert_eq!(range.len(), 4094);
        assert_eq!(range, VlanRange::any());
        assert_eq!(range.to_string(), "1-4094");
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert_eq!(
            "4095".parse::<VlanRange>(),
            Err(VlanRangeParseError::OutOfRange(4095))
        );
        assert_eq!(
            "0-5".parse::<VlanRange>(),
            Err(VlanRangeParseError::OutOfRange(0))
        );
        assert!(matches!(
            "10-2".parse::<VlanRange>(),
            Err(VlanRangeParseError::DescendingRun(10, 2))
        ));
        assert!(matches!(
            "abc".parse::<VlanRange>(),
            Err(VlanRangeParseError::InvalidItem(_))
        ));
    }

    #[test]
    fn display_merges_adjacent_runs() {
        let range: VlanRange = "100,101,102,200".parse().unwrap();
        assert_eq!(range.to_string(), "100-102,200");
    }

    #[test]
    fn set_operations() {
        let a: VlanRange = "100-105".parse().unwrap();
        let b: VlanRange = "103-110".parse().unwrap();
        assert_eq!(a.intersect(&b).to_string(), "103-105");
        assert_eq!(a.union(&b).to_string(), "100-110");
        assert_eq!(a.subtract(&b).to_string(), "100-102");
        assert!(a.intersect(&b).is_subset_of(&a));
        assert_eq!(VlanRange::single(vlan(102)).as_single(), Some(vlan(102)));
        assert_eq!(a.as_single(), None);
    }

    #[test]
    fn aggregate_urn_authority() {
        let urn = AggregateUrn::new("urn:publicid:IDN+emulab.net+authority+cm");
        assert_eq!(urn.authority(), Some("emulab.net"));
        assert_eq!(
            AggregateUrn::for_authority("ion.internet2.edu").as_str(),
            "urn:publicid:IDN+ion.internet2.edu+authority+cm"
        );
        assert_eq!(
            urn_authority("urn:publicid:IDN+emulab.net:shared+interface+x"),
            Some("emulab.net")
        );
        assert_eq!(urn_authority("not-a-urn"), None);
    }

    #[test]
    fn urn_slug_is_filesystem_safe() {
        let urn = AggregateUrn::new("urn:publicid:IDN+emulab.net+authority+cm");
        assert_eq!(urn.slug(), "urn-publicid-IDN-emulab.net-authority-cm");
    }

    proptest! {
        #[test]
        fn roundtrip_display_parse(tags in proptest::collection::btree_set(1u16..=4094, 0..50)) {
            let range = VlanRange(tags);
            if !range.is_empty() {
                let reparsed: VlanRange = range.to_string().parse().unwrap();
                prop_assert_eq!(reparsed, range);
            }
        }

        #[test]
        fn intersection_is_subset_of_both(
            a in proptest::collection::btree_set(1u16..=4094, 0..50),
            b in proptest::collection::btree_set(1u16..=4094, 0..50),
        ) {
            let a = VlanRange(a);
            let b = VlanRange(b);
            let i = a.intersect(&b);
            prop_assert!(i.is_subset_of(&a));
            prop_assert!(i.is_subset_of(&b));
        }

        #[test]
        fn subtract_then_union_restores(
            a in proptest::collection::btree_set(1u16..=4094, 0..50),
            b in proptest::collection::btree_set(1u16..=4094, 0..50),
        ) {
            let a = VlanRange(a);
            let b = VlanRange(b);
            prop_assert_eq!(a.subtract(&b).union(&a.intersect(&b)), a);
        }
    }
}
