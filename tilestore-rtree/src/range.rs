use std::fmt::{Debug, Formatter};

use tilestore_memory::pmr::{self, Allocator, TryCloneIn};
use tilestore_memory::MemoryResult;

use crate::datatype::Coord;

/// One range per dimension.
pub type NDRange = pmr::Vec<Range>;

/// One R-tree level: the MBRs of every node at that depth, left to right.
pub type Level = pmr::Vec<NDRange>;

/// A closed interval `[start, end]` on one dimension.
///
/// Fixed-size ranges hold the two coordinates back to back, little-endian.
/// Variable-size (string) ranges hold the start string followed by the end
/// string, with `start_size` marking the split. An empty range holds no
/// bytes and stands for "no constraint yet".
#[derive(PartialEq)]
pub struct Range {
    data: pmr::Vec<u8>,
    start_size: u64,
    var_size: bool,
}

impl Range {
    /// An empty range that will allocate from `alloc` once filled.
    pub fn new_in(alloc: Allocator) -> Self {
        Range {
            data: pmr::Vec::new_in(alloc),
            start_size: 0,
            var_size: false,
        }
    }

    /// A fixed-size range from its raw `start || end` encoding.
    pub fn from_bytes_in(bytes: &[u8], alloc: Allocator) -> MemoryResult<Self> {
        Ok(Range {
            data: pmr::Vec::from_slice_in(bytes, alloc)?,
            start_size: (bytes.len() / 2) as u64,
            var_size: false,
        })
    }

    pub fn from_values_in<T: Coord>(start: T, end: T, alloc: Allocator) -> MemoryResult<Self> {
        let mut data = pmr::Vec::with_capacity_in(2 * T::SIZE, alloc)?;
        data.resize_with(2 * T::SIZE, || 0u8)?;
        start.write_le(&mut data[..T::SIZE]);
        end.write_le(&mut data[T::SIZE..]);
        Ok(Range {
            data,
            start_size: T::SIZE as u64,
            var_size: false,
        })
    }

    /// A string range.
    pub fn from_str_in<S: AsRef<[u8]>>(start: S, end: S, alloc: Allocator) -> MemoryResult<Self> {
        let (start, end) = (start.as_ref(), end.as_ref());
        let mut data = pmr::Vec::with_capacity_in(start.len() + end.len(), alloc)?;
        data.extend_from_slice(start)?;
        data.extend_from_slice(end)?;
        Ok(Range {
            data,
            start_size: start.len() as u64,
            var_size: true,
        })
    }

    /// A string range from its raw `start || end` encoding.
    pub fn from_var_bytes_in(bytes: &[u8], start_size: u64, alloc: Allocator) -> MemoryResult<Self> {
        Ok(Range {
            data: pmr::Vec::from_slice_in(bytes, alloc)?,
            start_size: start_size.min(bytes.len() as u64),
            var_size: true,
        })
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn start_size(&self) -> u64 {
        self.start_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn var_size(&self) -> bool {
        self.var_size
    }

    pub fn allocator(&self) -> &Allocator {
        self.data.allocator()
    }

    /// True when start and end are equal.
    pub fn unary(&self) -> bool {
        let (start, end) = self.split();
        start == end
    }

    /// Decodes a fixed-size range as `(start, end)`. `None` if the stored
    /// width does not match `T`.
    pub fn bounds<T: Coord>(&self) -> Option<(T, T)> {
        if self.data.len() != 2 * T::SIZE {
            return None;
        }
        let start = T::from_le_slice(&self.data[..T::SIZE])?;
        let end = T::from_le_slice(&self.data[T::SIZE..])?;
        Some((start, end))
    }

    pub fn start_str(&self) -> &[u8] {
        self.split().0
    }

    pub fn end_str(&self) -> &[u8] {
        self.split().1
    }

    fn split(&self) -> (&[u8], &[u8]) {
        let at = if self.var_size {
            self.start_size as usize
        } else {
            self.data.len() / 2
        };
        self.data.split_at(at.min(self.data.len()))
    }
}

impl TryCloneIn for Range {
    fn try_clone_in(&self, alloc: &Allocator) -> MemoryResult<Self> {
        Ok(Range {
            data: pmr::Vec::from_slice_in(self.data.as_slice(), alloc.clone())?,
            start_size: self.start_size,
            var_size: self.var_size,
        })
    }
}

impl Debug for Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.var_size {
            f.debug_struct("Range")
                .field("start", &String::from_utf8_lossy(self.start_str()))
                .field("end", &String::from_utf8_lossy(self.end_str()))
                .finish()
        } else {
            f.debug_struct("Range").field("data", &self.data()).finish()
        }
    }
}

/// Builds an [`NDRange`] in `alloc` from already-built ranges.
pub fn ndrange_in(ranges: impl IntoIterator<Item = Range>, alloc: Allocator) -> MemoryResult<NDRange> {
    let mut ndrange = pmr::Vec::new_in(alloc);
    for range in ranges {
        ndrange.push(range)?;
    }
    Ok(ndrange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilestore_memory::{MemoryTrackerManager, MemoryType};

    #[test]
    fn fixed_range_bounds() {
        let range = Range::from_values_in(5i32, 10i32, Allocator::default()).unwrap();
        assert_eq!(range.size(), 8);
        assert_eq!(range.bounds::<i32>(), Some((5, 10)));
        assert_eq!(range.bounds::<i64>(), None);
        assert!(!range.unary());
        assert!(!range.var_size());
    }

    #[test]
    fn string_range_split() {
        let range = Range::from_str_in("aa", "bcd", Allocator::default()).unwrap();
        assert!(range.var_size());
        assert_eq!(range.start_size(), 2);
        assert_eq!(range.start_str(), b"aa");
        assert_eq!(range.end_str(), b"bcd");
        assert!(Range::from_str_in("x", "x", Allocator::default()).unwrap().unary());
    }

    #[test]
    fn empty_range() {
        let range = Range::new_in(Allocator::default());
        assert!(range.is_empty());
        assert_eq!(range.size(), 0);
        assert_eq!(range.start_str(), b"");
    }

    #[test]
    fn clone_moves_bytes_to_target_allocator() {
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        let range = Range::from_str_in("gggg", "ii", Allocator::default()).unwrap();

        let cloned = range
            .try_clone_in(&tracker.get_allocator(MemoryType::RTree))
            .unwrap();
        assert_eq!(cloned, range);
        assert_eq!(tracker.get_counts().1[&MemoryType::RTree], 6);

        drop(cloned);
        assert_eq!(tracker.get_counts().0, 0);
    }

    #[test]
    fn ndrange_charges_its_allocator() {
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        let alloc = tracker.get_allocator(MemoryType::RTree);
        let ndrange = ndrange_in(
            [
                Range::from_values_in(1u8, 2u8, alloc.clone()).unwrap(),
                Range::from_values_in(3u64, 4u64, alloc.clone()).unwrap(),
            ],
            alloc,
        )
        .unwrap();
        assert_eq!(ndrange.len(), 2);
        assert!(tracker.get_counts().0 >= 18);
    }
}
