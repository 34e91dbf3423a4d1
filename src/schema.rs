//! Region schemas, subspaces, and the read-only collaborators injected by
//! the daemon shell: the topology (schemas, subspaces, capture assignments)
//! and the state-transfer sink that consumes wipe notifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A partition of the key space assigned to one or more nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

/// Identifier for one capture stream; unique per transfer episode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureId(pub u64);

/// Identifier for a server process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "region({})", self.0)
    }
}

impl std::fmt::Display for CaptureId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "capture({})", self.0)
    }
}

/// Attribute types the data layer knows how to store and index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrType {
    /// Raw bytes, byte-wise comparable.
    Str,
    /// Signed 64-bit integer, little-endian in payloads.
    Int,
    /// 64-bit float, little-endian in payloads.
    Float,
    /// Ordered sequence of elements. Equality checks only.
    List(Box<AttrType>),
    /// Unordered collection of unique elements. Equality checks only.
    Set(Box<AttrType>),
    /// Key-to-value mapping. Equality checks only.
    Map(Box<AttrType>, Box<AttrType>),
}

impl AttrType {
    /// True for the container types, which cannot back range iterators.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            AttrType::List(_) | AttrType::Set(_) | AttrType::Map(_, _)
        )
    }
}

/// One attribute descriptor: a name and a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: AttrType,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: AttrType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Per-region schema: an ordered list of attribute descriptors.
/// Attribute 0 is the key. Immutable for the lifetime of a configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub attrs: Vec<Attribute>,
}

impl Schema {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        Self { attrs }
    }

    /// Total attribute count, including the key.
    pub fn arity(&self) -> usize {
        self.attrs.len()
    }

    /// The type of the key attribute.
    pub fn key_type(&self) -> &AttrType {
        &self.attrs[0].ty
    }
}

/// Per-region declaration of which attributes are indexed. Attribute 0 (the
/// key) is always considered indexed: the object namespace is its index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subspace {
    attrs: Vec<u16>,
}

impl Subspace {
    pub fn new(attrs: Vec<u16>) -> Self {
        Self { attrs }
    }

    pub fn indexed(&self, attr: u16) -> bool {
        attr == 0 || self.attrs.contains(&attr)
    }
}

/// The configuration view the data layer consumes, injected at construction
/// and swapped on reconfigure. Read-only from this side.
pub trait Topology: Send + Sync {
    /// The schema for a region, if the region is known.
    fn schema(&self, region: RegionId) -> Option<Schema>;

    /// The indexed-attribute declaration for a region.
    fn subspace(&self, region: RegionId) -> Option<Subspace>;

    /// The capture stream assigned to a region undergoing transfer.
    fn capture_for(&self, region: RegionId) -> Option<CaptureId>;

    /// Whether a capture stream is still live in the current configuration.
    fn is_captured(&self, capture: CaptureId) -> bool;

    /// The regions captured on behalf of the given server, i.e. those whose
    /// virtual owner on that server is non-empty.
    fn captured_regions(&self, us: ServerId) -> Vec<RegionId>;
}

/// The state-transfer collaborator. Receives a notification once every
/// capture-log entry of a stream has been purged.
pub trait TransferSink: Send + Sync {
    fn report_wiped(&self, capture: CaptureId);
}

/// Saved daemon identity, packed into the `"state"` metadata record and
/// returned on warm start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    pub server: ServerId,
    pub bind_to: String,
    pub coordinator: String,
}

/// Per-region capture counters. A region present in the map is captured;
/// `lookup` hands out the next dense sequence number for its capture log.
/// Replaced wholesale on reconfiguration via `adopt`.
#[derive(Debug, Default)]
pub struct CounterMap {
    counters: BTreeMap<RegionId, u64>,
}

impl CounterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next capture-log sequence number for the region, or None
    /// if the region is not captured. Numbers are dense and start at 0.
    pub fn lookup(&mut self, region: RegionId) -> Option<u64> {
        let counter = self.counters.get_mut(&region)?;
        let count = *counter;
        *counter += 1;
        Some(count)
    }

    /// Replaces the tracked region set. Counters for regions present in both
    /// the old and new sets are preserved; new regions start at 0.
    pub fn adopt(&mut self, regions: &[RegionId]) {
        let mut next = BTreeMap::new();
        for region in regions {
            let count = self.counters.get(region).copied().unwrap_or(0);
            next.insert(*region, count);
        }
        self.counters = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subspace_key_always_indexed() {
        let sub = Subspace::new(vec![2]);
        assert!(sub.indexed(0));
        assert!(!sub.indexed(1));
        assert!(sub.indexed(2));
    }

    #[test]
    fn test_counter_map_dense() {
        let mut counters = CounterMap::new();
        assert_eq!(counters.lookup(RegionId(1)), None);

        counters.adopt(&[RegionId(1), RegionId(2)]);
        assert_eq!(counters.lookup(RegionId(1)), Some(0));
        assert_eq!(counters.lookup(RegionId(1)), Some(1));
        assert_eq!(counters.lookup(RegionId(2)), Some(0));
        assert_eq!(counters.lookup(RegionId(3)), None);
    }

    #[test]
    fn test_counter_map_adopt_preserves_retained() {
        let mut counters = CounterMap::new();
        counters.adopt(&[RegionId(1), RegionId(2)]);
        counters.lookup(RegionId(1));
        counters.lookup(RegionId(1));

        counters.adopt(&[RegionId(1), RegionId(3)]);
        assert_eq!(counters.lookup(RegionId(1)), Some(2));
        assert_eq!(counters.lookup(RegionId(2)), None);
        assert_eq!(counters.lookup(RegionId(3)), Some(0));
    }
}
