//! Sorted address-interval index.
//!
//! Built once per module from `[lo, hi)` intervals and queried by binary
//! search. Well-formed debug info yields non-overlapping intervals; when a
//! producer emits overlaps anyway (inlined copies, identical-code folding) the
//! index still answers correctly by keeping a running maximum of interval ends,
//! and returns the interval with the greatest start among those containing the
//! address.

use tracing::debug;

/// One `[lo, hi)` interval and its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry<V>
{
    pub lo: u64,
    pub hi: u64,
    pub value: V,
}

impl<V> RangeEntry<V>
{
    pub fn contains(&self, address: u64) -> bool
    {
        self.lo <= address && address < self.hi
    }
}

#[derive(Debug, Clone)]
struct Slot<V>
{
    entry: RangeEntry<V>,
    // Largest `hi` among this slot and every slot before it.
    max_hi: u64,
}

/// Address → value interval map
#[derive(Debug, Clone)]
pub struct RangeMap<V>
{
    slots: Vec<Slot<V>>,
    overlapping: bool,
}

impl<V> Default for RangeMap<V>
{
    fn default() -> Self
    {
        Self {
            slots: Vec::new(),
            overlapping: false,
        }
    }
}

impl<V: Copy> RangeMap<V>
{
    /// Build the index. Empty intervals (`lo >= hi`) are dropped.
    pub fn new(entries: impl IntoIterator<Item = RangeEntry<V>>) -> Self
    {
        let mut entries: Vec<_> = entries.into_iter().filter(|e| e.lo < e.hi).collect();
        entries.sort_by_key(|e| (e.lo, e.hi));

        let mut overlapping = false;
        let mut max_hi = 0u64;
        let slots: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                if entry.lo < max_hi {
                    overlapping = true;
                }
                max_hi = max_hi.max(entry.hi);
                Slot { entry, max_hi }
            })
            .collect();

        if overlapping {
            debug!(ranges = slots.len(), "range map contains overlapping intervals");
        }
        Self { slots, overlapping }
    }

    pub fn len(&self) -> usize
    {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.slots.is_empty()
    }

    /// Whether any two intervals overlap.
    pub fn has_overlaps(&self) -> bool
    {
        self.overlapping
    }

    /// Find the interval containing `address`.
    pub fn find(&self, address: u64) -> Option<&RangeEntry<V>>
    {
        let mut index = self.slots.partition_point(|slot| slot.entry.lo <= address);
        while index > 0 && self.slots[index - 1].max_hi > address {
            index -= 1;
            if self.slots[index].entry.hi > address {
                return Some(&self.slots[index].entry);
            }
        }
        None
    }

    /// Value of the interval containing `address`.
    pub fn lookup(&self, address: u64) -> Option<V>
    {
        self.find(address).map(|entry| entry.value)
    }

    /// Intervals in ascending order of `lo`.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &RangeEntry<V>> + '_
    {
        self.slots.iter().map(|slot| &slot.entry)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn entry(lo: u64, hi: u64, value: u32) -> RangeEntry<u32>
    {
        RangeEntry { lo, hi, value }
    }

    #[test]
    fn test_lookup_disjoint()
    {
        let map = RangeMap::new([entry(0x30, 0x40, 3), entry(0x10, 0x20, 1), entry(0x20, 0x30, 2)]);
        assert!(!map.has_overlaps());
        assert_eq!(map.lookup(0x0f), None);
        assert_eq!(map.lookup(0x10), Some(1));
        assert_eq!(map.lookup(0x1f), Some(1));
        assert_eq!(map.lookup(0x20), Some(2));
        assert_eq!(map.lookup(0x3f), Some(3));
        assert_eq!(map.lookup(0x40), None);
    }

    #[test]
    fn test_lookup_with_gap()
    {
        let map = RangeMap::new([entry(0x10, 0x20, 1), entry(0x80, 0x90, 2)]);
        assert_eq!(map.lookup(0x50), None);
        assert_eq!(map.lookup(0x85), Some(2));
    }

    #[test]
    fn test_lookup_overlapping_prefers_inner()
    {
        let map = RangeMap::new([entry(0x100, 0x200, 1), entry(0x120, 0x140, 2)]);
        assert!(map.has_overlaps());
        assert_eq!(map.lookup(0x130), Some(2));
        assert_eq!(map.lookup(0x150), Some(1));
        assert_eq!(map.lookup(0x1ff), Some(1));
    }

    #[test]
    fn test_empty_intervals_dropped()
    {
        let map = RangeMap::new([entry(0x10, 0x10, 1), entry(0x20, 0x18, 2)]);
        assert!(map.is_empty());
        assert_eq!(map.lookup(0x10), None);
    }
}
