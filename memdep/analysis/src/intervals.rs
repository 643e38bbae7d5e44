//! Byte intervals and the per-target map from intervals to defining nodes.

use memdep_ir::{DefSite, NodeId, Offset};
use smallvec::SmallVec;

/// A half-open byte range `[start, start + length)`.
///
/// An unknown length leaves the range open-ended; an unknown start makes the
/// range span every byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: Offset,
    pub length: Offset,
}

impl Interval {
    pub fn new(start: impl Into<Offset>, length: impl Into<Offset>) -> Self {
        Interval {
            start: start.into(),
            length: length.into(),
        }
    }

    pub fn from_site(ds: &DefSite) -> Self {
        Interval {
            start: ds.offset,
            length: ds.length,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.start.is_unknown() || self.length.is_unknown()
    }

    pub fn end(&self) -> Offset {
        self.start + self.length
    }

    /// Concrete bounds: the lower bound, and the upper bound with `None`
    /// standing for "unbounded".
    pub(crate) fn bounds(&self) -> (u64, Option<u64>) {
        let lo = self.start.value().unwrap_or(0);
        let hi = if self.start.is_unknown() {
            None
        } else {
            self.end().value()
        };
        (lo, hi)
    }

    /// Does the range cover every byte?
    fn covers_all(&self) -> bool {
        let (lo, hi) = self.bounds();
        lo == 0 && hi.is_none()
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        let (alo, ahi) = self.bounds();
        let (blo, bhi) = other.bounds();
        let a_before_b = ahi.is_some_and(|hi| hi <= blo);
        let b_before_a = bhi.is_some_and(|hi| hi <= alo);
        !a_before_b && !b_before_a
    }
}

/// An ordered set of node ids, inline-allocated for the small sets that
/// dominate in practice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: SmallVec<[NodeId; 4]>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(node: NodeId) -> Self {
        let mut set = Self::new();
        set.insert(node);
        set
    }

    pub fn insert(&mut self, node: NodeId) -> bool {
        match self.nodes.binary_search(&node) {
            Ok(_) => false,
            Err(position) => {
                self.nodes.insert(position, node);
                true
            }
        }
    }

    pub fn extend_with(&mut self, other: &NodeSet) {
        for node in other.iter() {
            self.insert(node);
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<T: IntoIterator<Item = NodeId>>(iter: T) -> Self {
        let mut set = NodeSet::new();
        for node in iter {
            set.insert(node);
        }
        set
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = NodeId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, NodeId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter().copied()
    }
}

/// Maps byte intervals of one memory object to the nodes that may define
/// them.
///
/// Entries are kept sorted by start offset. They are never coalesced:
/// callers rely on per-interval identity when computing uncovered ranges.
/// Entries only overlap each other when an open-ended range was added on top
/// of existing ones; all queries tolerate that.
#[derive(Debug, Clone, Default)]
pub struct IntervalMap {
    entries: Vec<(Interval, NodeSet)>,
}

impl IntervalMap {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Interval, NodeSet)> {
        self.entries.iter()
    }

    fn insert_sorted(&mut self, interval: Interval, nodes: NodeSet) {
        let key = interval.bounds().0;
        let position = self
            .entries
            .partition_point(|(entry, _)| entry.bounds().0 <= key);
        self.entries.insert(position, (interval, nodes));
    }

    /// Record `node` as a possible definition of `interval`.
    ///
    /// The node joins the value-set of every overlapping entry; sub-ranges
    /// no entry covers yet get fresh entries of their own.
    pub fn add(&mut self, interval: Interval, node: NodeId) {
        self.add_set(interval, &NodeSet::singleton(node));
    }

    pub fn add_set(&mut self, interval: Interval, nodes: &NodeSet) {
        if nodes.is_empty() {
            return;
        }
        let gaps = self.uncovered(&interval);
        for (entry, set) in &mut self.entries {
            if entry.overlaps(&interval) {
                set.extend_with(nodes);
            }
        }
        for gap in gaps {
            self.insert_sorted(gap, nodes.clone());
        }
    }

    /// Record `node` as the definitive definition of `interval`, killing
    /// whatever was stored for those bytes. Overlapped entries keep only
    /// the prefix/suffix sticking out of `interval`.
    pub fn update(&mut self, interval: Interval, node: NodeId) {
        let (lo, hi) = interval.bounds();
        let mut kept: Vec<(Interval, NodeSet)> = Vec::new();
        for (entry, set) in std::mem::take(&mut self.entries) {
            if !entry.overlaps(&interval) {
                kept.push((entry, set));
                continue;
            }
            let (entry_lo, entry_hi) = entry.bounds();
            if entry_lo < lo {
                kept.push((Interval::new(entry_lo, lo - entry_lo), set.clone()));
            }
            if let Some(hi) = hi {
                match entry_hi {
                    Some(entry_hi) if entry_hi > hi => {
                        kept.push((Interval::new(hi, entry_hi - hi), set.clone()));
                    }
                    None => {
                        kept.push((Interval::new(Offset::new(hi), Offset::UNKNOWN), set.clone()));
                    }
                    _ => {}
                }
            }
        }
        kept.sort_by_key(|(entry, _)| entry.bounds().0);
        self.entries = kept;
        self.insert_sorted(interval, NodeSet::singleton(node));
    }

    /// Every node stored for a range overlapping the query.
    pub fn get(&self, interval: &Interval) -> NodeSet {
        let mut found = NodeSet::new();
        for (entry, set) in &self.entries {
            if entry.overlaps(interval) {
                found.extend_with(set);
            }
        }
        found
    }

    /// Insert `node` into every stored value-set.
    pub fn add_to_all(&mut self, node: NodeId) {
        for (_, set) in &mut self.entries {
            set.insert(node);
        }
    }

    /// The maximal sub-ranges of the query no stored entry covers.
    ///
    /// An open-ended query cannot be split: it comes back whole unless an
    /// identical entry (or one spanning every byte) is stored.
    pub fn uncovered(&self, interval: &Interval) -> Vec<Interval> {
        let (lo, hi) = interval.bounds();
        let Some(hi) = hi else {
            let covered = self
                .entries
                .iter()
                .any(|(entry, _)| entry == interval || entry.covers_all());
            return if covered { Vec::new() } else { vec![*interval] };
        };

        let mut gaps = Vec::new();
        let mut position = lo;
        for (entry, _) in &self.entries {
            let (entry_lo, entry_hi) = entry.bounds();
            if entry_lo >= hi {
                break;
            }
            if entry_hi.is_some_and(|entry_hi| entry_hi <= position) {
                continue;
            }
            if entry_lo > position {
                gaps.push(Interval::new(position, entry_lo - position));
            }
            match entry_hi {
                None => {
                    position = hi;
                    break;
                }
                Some(entry_hi) => position = position.max(entry_hi),
            }
            if position >= hi {
                break;
            }
        }
        if position < hi {
            gaps.push(Interval::new(position, hi - position));
        }
        gaps
    }
}
