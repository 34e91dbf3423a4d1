//! Search planning and the iterators behind it.
//!
//! A search starts from a list of attribute checks. Checks that pin or
//! bound an attribute collapse into per-attribute ranges; each range over
//! an indexed attribute yields an index iterator, and the object namespace
//! itself always yields the full-scan fallback. The planner intersects the
//! sorted candidates and keeps the result only when it beats the full scan
//! by the cost cutoff; whatever wins is wrapped in a search iterator that
//! re-reads every candidate object under the snapshot and re-checks the
//! original predicates.
//!
//! Iterator costs are measured in bytes of index entries spanned, cached on
//! first use. Full iteration is finite and non-restartable; `seek` is
//! permitted only on sorted iterators.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{self, codec_for, fixed_len, IndexCodec};
use crate::error::{Error, Result};
use crate::keyspace;
use crate::schema::{AttrType, RegionId, Schema, Subspace};
use crate::store::{SnapRange, Snapshot};
use crate::value;

/// Prefer the full scan unless an index plan is at least this many times
/// cheaper; trades planner optimism for scan locality.
const SCAN_CUTOFF: u64 = 4;

/// The predicates a search check can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Attribute equals the given payload.
    Equals,
    /// Attribute orders at or below the given payload.
    LessEqual,
    /// Attribute orders at or above the given payload.
    GreaterEqual,
    /// Container attribute contains the given element (map: key).
    Contains,
}

/// One predicate over one attribute. The payload is in the attribute's
/// value form; for `Contains` it is in the element's form.
#[derive(Clone, Debug)]
pub struct AttributeCheck {
    pub attr: u16,
    pub predicate: Predicate,
    pub value: Vec<u8>,
}

impl AttributeCheck {
    pub fn new(attr: u16, predicate: Predicate, value: Vec<u8>) -> Self {
        Self {
            attr,
            predicate,
            value,
        }
    }
}

/// A per-attribute `[start, end]` range derived from the checks. Bounds are
/// inclusive, in payload form, and either side may be open.
#[derive(Clone, Debug)]
pub struct AttrRange {
    pub attr: u16,
    pub ty: AttrType,
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

/// The iterator contract shared by index iterators, region scans, and their
/// compositions. `valid` positions the iterator on the next live entry and
/// may skip entries; it reports false permanently once the iterator is
/// exhausted or hits undecodable data.
pub trait DataIterator {
    fn valid(&mut self) -> bool;
    fn next(&mut self);
    /// The current entry's user key. Meaningful only after `valid()`.
    fn key(&self) -> &[u8];
    /// The current entry's encoded key, as stored inside index entries.
    fn internal_key(&self) -> &[u8];
    /// Whether traversal order matches the object-key order.
    fn sorted(&self) -> bool;
    /// Bytes of entries spanned, snapshotted before first use.
    fn cost(&mut self) -> u64;
    /// Repositions at the first entry with encoded key >= the given one.
    /// Permitted only on sorted iterators.
    fn seek(&mut self, internal_key: &[u8]);
    fn snap(&self) -> &Arc<Snapshot>;
}

/// Lazily walks one contiguous key range of a snapshot, one entry at a
/// time, with re-positioning support.
struct RangeWalk {
    snap: Arc<Snapshot>,
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    range: Option<SnapRange>,
    current: Option<Vec<u8>>,
    exhausted: bool,
}

impl RangeWalk {
    fn new(snap: Arc<Snapshot>, lo: Vec<u8>, hi: Option<Vec<u8>>) -> Self {
        Self {
            snap,
            lo,
            hi,
            range: None,
            current: None,
            exhausted: false,
        }
    }

    /// The key of the entry under the walk, pulling the next one if the
    /// previous was consumed. None once the range is exhausted.
    fn current(&mut self) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        if self.current.is_none() {
            if self.range.is_none() {
                self.range = Some(self.snap.range(&self.lo, self.hi.as_deref())?);
            }

            if let Some(range) = self.range.as_mut() {
                match range.next() {
                    None => self.exhausted = true,
                    Some(item) => {
                        let (key, _) = item?;
                        self.current = Some(key.value().to_vec());
                    }
                }
            }
        }

        Ok(self.current.clone())
    }

    /// Consumes the entry under the walk.
    fn advance(&mut self) {
        self.current = None;
    }

    /// Restarts the walk at a new lower bound.
    fn reposition(&mut self, lo: Vec<u8>) {
        self.lo = lo;
        self.range = None;
        self.current = None;
        self.exhausted = false;
    }

    /// Sum of key sizes from the walk's current position to its upper
    /// bound. Leaves the walk untouched.
    fn span_cost(&mut self) -> Result<u64> {
        let lo = match self.current()? {
            Some(key) => key,
            None => return Ok(0),
        };

        let mut total = 0u64;
        for item in self.snap.range(&lo, self.hi.as_deref())? {
            let (key, _) = item?;
            total += key.value().len() as u64;
        }
        Ok(total)
    }
}

/// Walks the index entries of one attribute within `[start, end]`, yielding
/// object keys in (value, key) order. Sorted only when the range pins a
/// single value.
pub struct IndexRangeIter {
    walk: RangeWalk,
    region: RegionId,
    attr: u16,
    enc_start: Option<Vec<u8>>,
    enc_end: Option<Vec<u8>>,
    val_codec: &'static dyn IndexCodec,
    key_codec: &'static dyn IndexCodec,
    cur_internal: Vec<u8>,
    cur_user: Vec<u8>,
    invalid: bool,
    cached_cost: Option<u64>,
}

impl IndexRangeIter {
    pub(crate) fn new(
        snap: Arc<Snapshot>,
        region: RegionId,
        attr: u16,
        enc_start: Option<Vec<u8>>,
        enc_end: Option<Vec<u8>>,
        val_codec: &'static dyn IndexCodec,
        key_codec: &'static dyn IndexCodec,
    ) -> Self {
        let prefix = keyspace::index_prefix(region, attr);

        let mut lo = prefix.clone();
        if let Some(start) = &enc_start {
            lo.extend_from_slice(start);
        }

        let hi = match &enc_end {
            Some(end) => {
                let mut upper = prefix.clone();
                upper.extend_from_slice(end);
                keyspace::bump(&upper)
            }
            None => keyspace::bump(&prefix),
        };

        Self {
            walk: RangeWalk::new(snap, lo, hi),
            region,
            attr,
            enc_start,
            enc_end,
            val_codec,
            key_codec,
            cur_internal: Vec::new(),
            cur_user: Vec::new(),
            invalid: false,
            cached_cost: None,
        }
    }
}

impl DataIterator for IndexRangeIter {
    fn valid(&mut self) -> bool {
        while !self.invalid {
            let key = match self.walk.current() {
                Ok(Some(key)) => key,
                Ok(None) => return false,
                Err(err) => {
                    warn!(error = %err, "index iterator stopping on store error");
                    self.invalid = true;
                    return false;
                }
            };

            let decoded = keyspace::decode_index_key(
                &key,
                fixed_len(self.val_codec),
                fixed_len(self.key_codec),
            );
            let (region, attr, enc_value, enc_key) = match decoded {
                Ok(parts) => parts,
                Err(_) => {
                    self.invalid = true;
                    return false;
                }
            };

            if region != self.region || attr != self.attr {
                self.invalid = true;
                return false;
            }

            // Composite entries for variable-length values do not sort
            // purely by value, so out-of-range values are skipped rather
            // than treated as terminal.
            if let Some(start) = &self.enc_start {
                if enc_value < start.as_slice() {
                    self.walk.advance();
                    continue;
                }
            }
            if let Some(end) = &self.enc_end {
                if enc_value > end.as_slice() {
                    self.walk.advance();
                    continue;
                }
            }

            let user = match self.key_codec.decode(enc_key) {
                Ok(user) => user,
                Err(_) => {
                    self.invalid = true;
                    return false;
                }
            };

            self.cur_internal = enc_key.to_vec();
            self.cur_user = user;
            return true;
        }

        false
    }

    fn next(&mut self) {
        self.walk.advance();
    }

    fn key(&self) -> &[u8] {
        &self.cur_user
    }

    fn internal_key(&self) -> &[u8] {
        &self.cur_internal
    }

    fn sorted(&self) -> bool {
        self.enc_start.is_some() && self.enc_start == self.enc_end
    }

    fn cost(&mut self) -> u64 {
        if let Some(cost) = self.cached_cost {
            return cost;
        }

        let cost = match self.walk.span_cost() {
            Ok(cost) => cost,
            Err(err) => {
                warn!(error = %err, "index iterator cost estimation failed");
                u64::MAX
            }
        };
        self.cached_cost = Some(cost);
        cost
    }

    fn seek(&mut self, internal_key: &[u8]) {
        if !self.sorted() {
            self.invalid = true;
            return;
        }

        // sorted implies start == end, so the pinned value prefixes the probe
        let Some(value) = self.enc_start.as_deref() else {
            self.invalid = true;
            return;
        };

        let both_variable = !self.val_codec.encoding_fixed() && !self.key_codec.encoding_fixed();
        let lo = keyspace::index_key(self.region, self.attr, value, internal_key, both_variable);
        self.walk.reposition(lo);
    }

    fn snap(&self) -> &Arc<Snapshot> {
        &self.walk.snap
    }
}

/// Walks the object namespace of a region, optionally bounded by a key
/// range. Serves both as the region iterator handed to state transfer and
/// as the full-scan fallback plan. Always sorted.
pub struct ObjectRangeIter {
    walk: RangeWalk,
    region: RegionId,
    enc_start: Option<Vec<u8>>,
    enc_end: Option<Vec<u8>>,
    key_codec: &'static dyn IndexCodec,
    cur_internal: Vec<u8>,
    cur_user: Vec<u8>,
    invalid: bool,
    cached_cost: Option<u64>,
}

impl ObjectRangeIter {
    pub(crate) fn new(
        snap: Arc<Snapshot>,
        region: RegionId,
        enc_start: Option<Vec<u8>>,
        enc_end: Option<Vec<u8>>,
        key_codec: &'static dyn IndexCodec,
    ) -> Self {
        let prefix = keyspace::region_prefix(region);

        let mut lo = prefix.clone();
        if let Some(start) = &enc_start {
            lo.extend_from_slice(start);
        }

        let hi = match &enc_end {
            Some(end) => {
                let mut upper = prefix.clone();
                upper.extend_from_slice(end);
                keyspace::bump(&upper)
            }
            None => keyspace::bump(&prefix),
        };

        Self {
            walk: RangeWalk::new(snap, lo, hi),
            region,
            enc_start,
            enc_end,
            key_codec,
            cur_internal: Vec::new(),
            cur_user: Vec::new(),
            invalid: false,
            cached_cost: None,
        }
    }
}

impl DataIterator for ObjectRangeIter {
    fn valid(&mut self) -> bool {
        while !self.invalid {
            let key = match self.walk.current() {
                Ok(Some(key)) => key,
                Ok(None) => return false,
                Err(err) => {
                    warn!(error = %err, "region iterator stopping on store error");
                    self.invalid = true;
                    return false;
                }
            };

            let (region, enc_key) = match keyspace::decode_object_key(&key) {
                Ok(parts) => parts,
                Err(_) => {
                    self.invalid = true;
                    return false;
                }
            };

            if region != self.region {
                self.invalid = true;
                return false;
            }

            if let Some(start) = &self.enc_start {
                if enc_key < start.as_slice() {
                    self.walk.advance();
                    continue;
                }
            }
            if let Some(end) = &self.enc_end {
                if enc_key > end.as_slice() {
                    self.walk.advance();
                    continue;
                }
            }

            let user = match self.key_codec.decode(enc_key) {
                Ok(user) => user,
                Err(_) => {
                    self.invalid = true;
                    return false;
                }
            };

            self.cur_internal = enc_key.to_vec();
            self.cur_user = user;
            return true;
        }

        false
    }

    fn next(&mut self) {
        self.walk.advance();
    }

    fn key(&self) -> &[u8] {
        &self.cur_user
    }

    fn internal_key(&self) -> &[u8] {
        &self.cur_internal
    }

    fn sorted(&self) -> bool {
        true
    }

    fn cost(&mut self) -> u64 {
        if let Some(cost) = self.cached_cost {
            return cost;
        }

        let cost = match self.walk.span_cost() {
            Ok(cost) => cost,
            Err(err) => {
                warn!(error = %err, "region iterator cost estimation failed");
                u64::MAX
            }
        };
        self.cached_cost = Some(cost);
        cost
    }

    fn seek(&mut self, internal_key: &[u8]) {
        let lo = keyspace::object_key(self.region, internal_key);
        self.walk.reposition(lo);
    }

    fn snap(&self) -> &Arc<Snapshot> {
        &self.walk.snap
    }
}

/// The empty plan, used when a check is provably unsatisfiable.
pub struct EmptyIter {
    snap: Arc<Snapshot>,
}

impl EmptyIter {
    pub(crate) fn new(snap: Arc<Snapshot>) -> Self {
        Self { snap }
    }
}

impl DataIterator for EmptyIter {
    fn valid(&mut self) -> bool {
        false
    }

    fn next(&mut self) {}

    fn key(&self) -> &[u8] {
        &[]
    }

    fn internal_key(&self) -> &[u8] {
        &[]
    }

    fn sorted(&self) -> bool {
        true
    }

    fn cost(&mut self) -> u64 {
        0
    }

    fn seek(&mut self, _internal_key: &[u8]) {}

    fn snap(&self) -> &Arc<Snapshot> {
        &self.snap
    }
}

/// Lockstep intersection of sorted iterators: emits an internal key when
/// every child agrees on it, otherwise seeks the laggards forward to the
/// current maximum.
pub struct IntersectIter {
    snap: Arc<Snapshot>,
    children: Vec<Box<dyn DataIterator>>,
    cached_cost: Option<u64>,
}

impl IntersectIter {
    pub(crate) fn new(snap: Arc<Snapshot>, children: Vec<Box<dyn DataIterator>>) -> Self {
        debug_assert!(!children.is_empty());
        Self {
            snap,
            children,
            cached_cost: None,
        }
    }
}

impl DataIterator for IntersectIter {
    fn valid(&mut self) -> bool {
        loop {
            for child in self.children.iter_mut() {
                if !child.valid() {
                    return false;
                }
            }

            let mut target: Vec<u8> = Vec::new();
            for child in &self.children {
                if child.internal_key() > target.as_slice() {
                    target = child.internal_key().to_vec();
                }
            }

            if self
                .children
                .iter()
                .all(|child| child.internal_key() == target.as_slice())
            {
                return true;
            }

            for child in self.children.iter_mut() {
                if child.internal_key() < target.as_slice() {
                    child.seek(&target);
                }
            }
        }
    }

    fn next(&mut self) {
        for child in self.children.iter_mut() {
            child.next();
        }
    }

    fn key(&self) -> &[u8] {
        self.children[0].key()
    }

    fn internal_key(&self) -> &[u8] {
        self.children[0].internal_key()
    }

    fn sorted(&self) -> bool {
        true
    }

    fn cost(&mut self) -> u64 {
        if let Some(cost) = self.cached_cost {
            return cost;
        }

        // the intersection visits no more entries than its cheapest child
        let cost = self
            .children
            .iter_mut()
            .map(|child| child.cost())
            .min()
            .unwrap_or(0);
        self.cached_cost = Some(cost);
        cost
    }

    fn seek(&mut self, internal_key: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(internal_key);
        }
    }

    fn snap(&self) -> &Arc<Snapshot> {
        &self.snap
    }
}

/// Wraps the chosen plan: for every candidate key, re-reads the object
/// under the snapshot and keeps it only if all original checks pass.
pub struct SearchIter {
    snap: Arc<Snapshot>,
    region: RegionId,
    schema: Schema,
    checks: Vec<AttributeCheck>,
    best: Box<dyn DataIterator>,
    cur_user: Option<Vec<u8>>,
    scan_fallback: bool,
    planned_cost: u64,
}

impl SearchIter {
    /// Whether the planner fell back to the full region scan.
    pub fn scan_fallback(&self) -> bool {
        self.scan_fallback
    }

    /// The chosen plan's cost estimate.
    pub fn planned_cost(&self) -> u64 {
        self.planned_cost
    }
}

impl DataIterator for SearchIter {
    fn valid(&mut self) -> bool {
        if self.cur_user.is_some() {
            return true;
        }

        while self.best.valid() {
            let object_key = keyspace::object_key(self.region, self.best.internal_key());

            let body = match self.snap.get(&object_key) {
                Ok(Some(body)) => body,
                Ok(None) => {
                    // the index entry outlived its object; skip it
                    self.best.next();
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "search iterator skipping unreadable object");
                    self.best.next();
                    continue;
                }
            };

            let passes = value::decode_object(&body)
                .ok()
                .filter(|(values, _)| values.len() + 1 == self.schema.arity())
                .map(|(values, _)| {
                    check_matches(&self.schema, &self.checks, self.best.key(), &values)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            if passes {
                self.cur_user = Some(self.best.key().to_vec());
                return true;
            }

            self.best.next();
        }

        false
    }

    fn next(&mut self) {
        self.best.next();
        self.cur_user = None;
    }

    fn key(&self) -> &[u8] {
        self.cur_user.as_deref().unwrap_or(&[])
    }

    fn internal_key(&self) -> &[u8] {
        self.best.internal_key()
    }

    fn sorted(&self) -> bool {
        self.best.sorted()
    }

    fn cost(&mut self) -> u64 {
        self.planned_cost
    }

    fn seek(&mut self, internal_key: &[u8]) {
        self.best.seek(internal_key);
        self.cur_user = None;
    }

    fn snap(&self) -> &Arc<Snapshot> {
        &self.snap
    }
}

/// Evaluates every check against one decoded object.
pub fn check_matches(
    schema: &Schema,
    checks: &[AttributeCheck],
    key: &[u8],
    values: &[Vec<u8>],
) -> Result<bool> {
    for check in checks {
        let attr = check.attr as usize;
        if attr >= schema.arity() {
            return Ok(false);
        }

        let ty = &schema.attrs[attr].ty;
        let subject: &[u8] = if attr == 0 { key } else { &values[attr - 1] };

        let passes = match check.predicate {
            Predicate::Equals => subject == check.value.as_slice(),
            Predicate::LessEqual => ordered_cmp(ty, subject, &check.value)? != Ordering::Greater,
            Predicate::GreaterEqual => ordered_cmp(ty, subject, &check.value)? != Ordering::Less,
            Predicate::Contains => value::payload_contains(ty, subject, &check.value)?,
        };

        if !passes {
            return Ok(false);
        }
    }

    Ok(true)
}

fn ordered_cmp(ty: &AttrType, a: &[u8], b: &[u8]) -> Result<Ordering> {
    let Some(c) = codec_for(ty) else {
        return Err(Error::BadEncoding(
            "ordered comparison on a container attribute".to_string(),
        ));
    };
    codec::compare(c, a, b)
}

/// Derives per-attribute ranges from the checks. Returns None when any
/// check is invalid or unsatisfiable, which short-circuits the whole query
/// to an empty result.
pub fn range_searches(schema: &Schema, checks: &[AttributeCheck]) -> Option<Vec<AttrRange>> {
    #[derive(Default)]
    struct Acc {
        eq: Option<Vec<u8>>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    }

    let mut accs: std::collections::BTreeMap<u16, Acc> = std::collections::BTreeMap::new();

    for check in checks {
        let attr = check.attr as usize;
        if attr >= schema.arity() {
            return None;
        }

        let ty = &schema.attrs[attr].ty;

        match check.predicate {
            Predicate::Equals => {
                let acc = accs.entry(check.attr).or_default();
                match &acc.eq {
                    Some(prior) if prior != &check.value => return None,
                    _ => acc.eq = Some(check.value.clone()),
                }
            }
            Predicate::LessEqual | Predicate::GreaterEqual => {
                let c = codec_for(ty)?;
                let acc = accs.entry(check.attr).or_default();

                if check.predicate == Predicate::GreaterEqual {
                    let tighter = match &acc.lower {
                        Some(lower) => {
                            codec::compare(c, &check.value, lower).ok()? == Ordering::Greater
                        }
                        None => true,
                    };
                    if tighter {
                        acc.lower = Some(check.value.clone());
                    }
                } else {
                    let tighter = match &acc.upper {
                        Some(upper) => {
                            codec::compare(c, &check.value, upper).ok()? == Ordering::Less
                        }
                        None => true,
                    };
                    if tighter {
                        acc.upper = Some(check.value.clone());
                    }
                }
            }
            Predicate::Contains => {
                if !ty.is_container() {
                    return None;
                }
            }
        }
    }

    let mut ranges = Vec::with_capacity(accs.len());

    for (attr, acc) in accs {
        let ty = schema.attrs[attr as usize].ty.clone();

        let (start, end) = if let Some(eq) = acc.eq {
            if let Some(c) = codec_for(&ty) {
                if let Some(lower) = &acc.lower {
                    if codec::compare(c, &eq, lower).ok()? == Ordering::Less {
                        return None;
                    }
                }
                if let Some(upper) = &acc.upper {
                    if codec::compare(c, &eq, upper).ok()? == Ordering::Greater {
                        return None;
                    }
                }
            }
            (Some(eq.clone()), Some(eq))
        } else {
            if let (Some(lower), Some(upper)) = (&acc.lower, &acc.upper) {
                let c = codec_for(&ty)?;
                if codec::compare(c, lower, upper).ok()? == Ordering::Greater {
                    return None;
                }
            }
            (acc.lower, acc.upper)
        };

        if start.is_none() && end.is_none() {
            continue;
        }

        ranges.push(AttrRange {
            attr,
            ty,
            start,
            end,
        });
    }

    Some(ranges)
}

/// Plans a search: builds candidate iterators from the ranges, costs them,
/// and picks the sorted intersection or the full region scan.
pub(crate) fn plan_search(
    snap: Arc<Snapshot>,
    region: RegionId,
    schema: Schema,
    subspace: Subspace,
    checks: Vec<AttributeCheck>,
) -> Result<SearchIter> {
    let key_codec = codec_for(schema.key_type()).ok_or_else(|| {
        Error::Db("the key attribute's type cannot back the object namespace".to_string())
    })?;

    let Some(ranges) = range_searches(&schema, &checks) else {
        debug!("search has an unsatisfiable check; returning no results");
        return Ok(SearchIter {
            best: Box::new(EmptyIter::new(snap.clone())),
            snap,
            region,
            schema,
            checks,
            cur_user: None,
            scan_fallback: false,
            planned_cost: 0,
        });
    };

    let mut candidates: Vec<Box<dyn DataIterator>> = Vec::new();

    for range in &ranges {
        if !subspace.indexed(range.attr) {
            continue;
        }

        let codec = if range.attr == 0 {
            key_codec
        } else {
            match codec_for(&range.ty) {
                Some(codec) => codec,
                None => continue,
            }
        };

        candidates.push(codec.iterator_from_range(snap.clone(), region, range, key_codec)?);
    }

    for check in &checks {
        if check.predicate != Predicate::Contains || !subspace.indexed(check.attr) {
            continue;
        }

        let ty = &schema.attrs[check.attr as usize].ty;
        if let Some(codec) = codec_for(ty) {
            if let Some(it) = codec.iterator_from_check(snap.clone(), region, check, key_codec)? {
                candidates.push(it);
            }
        }
    }

    let mut full_scan = ObjectRangeIter::new(snap.clone(), region, None, None, key_codec);
    let full_cost = full_scan.cost();
    debug!(cost = full_cost, "accessing all objects");

    let mut sorted: Vec<Box<dyn DataIterator>> = Vec::new();
    for mut candidate in candidates {
        let cost = candidate.cost();
        debug!(cost, sorted = candidate.sorted(), "search candidate");
        if candidate.sorted() {
            sorted.push(candidate);
        }
    }

    let mut best: Option<Box<dyn DataIterator>> = if sorted.is_empty() {
        None
    } else {
        Some(Box::new(IntersectIter::new(snap.clone(), sorted)))
    };

    let use_scan = match best.as_mut() {
        None => true,
        Some(b) => b.cost().saturating_mul(SCAN_CUTOFF) > full_cost,
    };

    let (best, scan_fallback) = if use_scan {
        (Box::new(full_scan) as Box<dyn DataIterator>, true)
    } else {
        (best.take().ok_or_else(|| Error::Db("no plan".to_string()))?, false)
    };

    let mut chosen = SearchIter {
        snap,
        region,
        schema,
        checks,
        best,
        cur_user: None,
        scan_fallback,
        planned_cost: 0,
    };
    chosen.planned_cost = chosen.best.cost();
    debug!(
        cost = chosen.planned_cost,
        scan = chosen.scan_fallback,
        "search plan chosen"
    );
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use crate::value::int_payload;

    fn schema() -> Schema {
        Schema::new(vec![
            Attribute::new("k", AttrType::Str),
            Attribute::new("v", AttrType::Int),
            Attribute::new("w", AttrType::Str),
        ])
    }

    #[test]
    fn test_range_searches_equality_pins_range() {
        let checks = vec![AttributeCheck::new(1, Predicate::Equals, int_payload(5))];
        let ranges = range_searches(&schema(), &checks).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].attr, 1);
        assert_eq!(ranges[0].start, Some(int_payload(5)));
        assert_eq!(ranges[0].end, Some(int_payload(5)));
    }

    #[test]
    fn test_range_searches_folds_bounds() {
        let checks = vec![
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(2)),
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(5)),
            AttributeCheck::new(1, Predicate::LessEqual, int_payload(9)),
        ];
        let ranges = range_searches(&schema(), &checks).unwrap();
        assert_eq!(ranges[0].start, Some(int_payload(5)));
        assert_eq!(ranges[0].end, Some(int_payload(9)));
    }

    #[test]
    fn test_range_searches_detects_contradictions() {
        let conflicting_eq = vec![
            AttributeCheck::new(1, Predicate::Equals, int_payload(1)),
            AttributeCheck::new(1, Predicate::Equals, int_payload(2)),
        ];
        assert!(range_searches(&schema(), &conflicting_eq).is_none());

        let empty_window = vec![
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(9)),
            AttributeCheck::new(1, Predicate::LessEqual, int_payload(3)),
        ];
        assert!(range_searches(&schema(), &empty_window).is_none());

        let eq_outside = vec![
            AttributeCheck::new(1, Predicate::Equals, int_payload(1)),
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(5)),
        ];
        assert!(range_searches(&schema(), &eq_outside).is_none());
    }

    #[test]
    fn test_range_searches_rejects_bad_attrs() {
        let out_of_range = vec![AttributeCheck::new(9, Predicate::Equals, vec![])];
        assert!(range_searches(&schema(), &out_of_range).is_none());

        let contains_on_scalar = vec![AttributeCheck::new(1, Predicate::Contains, int_payload(1))];
        assert!(range_searches(&schema(), &contains_on_scalar).is_none());
    }

    #[test]
    fn test_check_matches() {
        let schema = schema();
        let values = vec![int_payload(42), b"x".to_vec()];

        let eq = vec![AttributeCheck::new(1, Predicate::Equals, int_payload(42))];
        assert!(check_matches(&schema, &eq, b"alice", &values).unwrap());

        let range = vec![
            AttributeCheck::new(1, Predicate::GreaterEqual, int_payload(0)),
            AttributeCheck::new(1, Predicate::LessEqual, int_payload(50)),
            AttributeCheck::new(2, Predicate::Equals, b"x".to_vec()),
        ];
        assert!(check_matches(&schema, &range, b"alice", &values).unwrap());

        let miss = vec![AttributeCheck::new(1, Predicate::LessEqual, int_payload(41))];
        assert!(!check_matches(&schema, &miss, b"alice", &values).unwrap());

        let on_key = vec![AttributeCheck::new(0, Predicate::Equals, b"alice".to_vec())];
        assert!(check_matches(&schema, &on_key, b"alice", &values).unwrap());
        assert!(!check_matches(&schema, &on_key, b"bob", &values).unwrap());
    }

    #[test]
    fn test_check_matches_negative_ints_order_numerically() {
        let schema = schema();
        let values = vec![int_payload(-10), b"".to_vec()];
        let checks = vec![AttributeCheck::new(1, Predicate::LessEqual, int_payload(-1))];
        assert!(check_matches(&schema, &checks, b"k", &values).unwrap());
    }
}
