use tilestore_memory::pmr::{Allocator, TryCloneIn};
use tilestore_memory::MemoryResult;

use crate::datatype::{dispatch_coord, Coord, Datatype};
use crate::range::Range;
use crate::rtree::{RTreeError, RTreeResult};

/// One axis of a domain.
///
/// A dimension knows how to compare, measure and merge ranges of its
/// datatype. Ranges handed to it are assumed to have been built for that
/// datatype; a range of the wrong width behaves as if it did not overlap
/// anything.
#[derive(Debug)]
pub struct Dimension {
    name: String,
    datatype: Datatype,
    domain: Range,
    tile_extent: Option<Vec<u8>>,
}

impl Dimension {
    pub fn new(name: &str, datatype: Datatype) -> Self {
        Dimension {
            name: name.to_string(),
            datatype,
            domain: Range::new_in(Allocator::default()),
            tile_extent: None,
        }
    }

    /// Sets the dimension's domain. Fails if `T` is not this dimension's
    /// datatype or if `start > end`.
    pub fn with_domain<T: Coord>(mut self, start: T, end: T) -> RTreeResult<Self> {
        self.check_type::<T>()?;
        if start > end {
            return Err(RTreeError::InvalidOperation(format!(
                "Domain of dimension {} has start {:?} past end {:?}",
                self.name, start, end
            )));
        }
        self.domain = Range::from_values_in(start, end, Allocator::default())?;
        Ok(self)
    }

    pub fn with_tile_extent<T: Coord>(mut self, extent: T) -> RTreeResult<Self> {
        self.check_type::<T>()?;
        let mut bytes = vec![0u8; T::SIZE];
        extent.write_le(&mut bytes);
        self.tile_extent = Some(bytes);
        Ok(self)
    }

    fn check_type<T: Coord>(&self) -> RTreeResult<()> {
        if T::DATATYPE != self.datatype {
            return Err(RTreeError::InvalidOperation(format!(
                "Dimension {} has datatype {} but a {} value was given",
                self.name,
                self.datatype,
                T::DATATYPE
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// The dimension's domain; empty for string dimensions.
    pub fn domain(&self) -> &Range {
        &self.domain
    }

    pub fn tile_extent<T: Coord>(&self) -> Option<T> {
        if T::DATATYPE != self.datatype {
            return None;
        }
        self.tile_extent.as_deref().and_then(T::from_le_slice)
    }

    /// Bytes of one coordinate.
    pub fn coord_size(&self) -> usize {
        self.datatype.size()
    }

    pub fn var_size(&self) -> bool {
        self.datatype.is_string()
    }

    /// True if `r1` and `r2` intersect.
    pub fn overlap(&self, r1: &Range, r2: &Range) -> bool {
        dispatch_coord!(self.datatype, T => overlap_fixed::<T>(r1, r2), string => overlap_str(r1, r2))
    }

    /// True if `r1` lies entirely within `r2`.
    pub fn covered(&self, r1: &Range, r2: &Range) -> bool {
        dispatch_coord!(self.datatype, T => covered_fixed::<T>(r1, r2), string => covered_str(r1, r2))
    }

    /// Fraction of `mbr` covered by `range`, in `[0, 1]`.
    ///
    /// Integer spans count both endpoints. A zero-width float span counts as
    /// the smallest positive value of the type. For strings only the first
    /// character after the MBR's common prefix is measured, and a partial
    /// overlap never reports exactly 1.
    pub fn overlap_ratio(&self, range: &Range, mbr: &Range) -> f64 {
        dispatch_coord!(self.datatype, T => ratio_fixed::<T>(range, mbr), string => ratio_str(range, mbr))
    }

    /// Grows `r2` so that it also covers `r1`. An empty `r2` becomes a copy
    /// of `r1` in `r2`'s allocator; an empty `r1` leaves `r2` untouched.
    pub fn expand_range(&self, r1: &Range, r2: &mut Range) -> MemoryResult<()> {
        if r1.is_empty() {
            return Ok(());
        }
        if r2.is_empty() {
            let copy = r1.try_clone_in(r2.allocator())?;
            *r2 = copy;
            return Ok(());
        }
        dispatch_coord!(self.datatype, T => expand_fixed::<T>(r1, r2), string => expand_str(r1, r2))
    }
}

fn overlap_fixed<T: Coord>(r1: &Range, r2: &Range) -> bool {
    match (r1.bounds::<T>(), r2.bounds::<T>()) {
        (Some(a), Some(b)) => !(a.0 > b.1 || a.1 < b.0),
        _ => false,
    }
}

fn covered_fixed<T: Coord>(r1: &Range, r2: &Range) -> bool {
    match (r1.bounds::<T>(), r2.bounds::<T>()) {
        (Some(a), Some(b)) => a.0 >= b.0 && a.1 <= b.1,
        _ => false,
    }
}

fn ratio_fixed<T: Coord>(range: &Range, mbr: &Range) -> f64 {
    let (Some(r), Some(m)) = (range.bounds::<T>(), mbr.bounds::<T>()) else {
        return 0.0;
    };
    if r.0 > m.1 || r.1 < m.0 {
        return 0.0;
    }

    let o_start = if r.0 > m.0 { r.0 } else { m.0 };
    let o_end = if r.1 < m.1 { r.1 } else { m.1 };
    let mut o_span = T::span(o_start, o_end);
    let mut mbr_span = T::span(m.0, m.1);
    if T::IS_INTEGER {
        o_span += 1.0;
        mbr_span += 1.0;
    } else {
        if o_span == 0.0 {
            o_span = T::min_positive_span();
        }
        if mbr_span == 0.0 {
            mbr_span = T::min_positive_span();
        }
    }
    o_span / mbr_span
}

fn expand_fixed<T: Coord>(r1: &Range, r2: &mut Range) -> MemoryResult<()> {
    let (Some(a), Some(b)) = (r1.bounds::<T>(), r2.bounds::<T>()) else {
        return Ok(());
    };
    let start = if a.0 < b.0 { a.0 } else { b.0 };
    let end = if a.1 > b.1 { a.1 } else { b.1 };
    let expanded = Range::from_values_in(start, end, r2.allocator().clone())?;
    *r2 = expanded;
    Ok(())
}

fn overlap_str(r1: &Range, r2: &Range) -> bool {
    !(r1.start_str() > r2.end_str() || r1.end_str() < r2.start_str())
}

fn covered_str(r1: &Range, r2: &Range) -> bool {
    r1.start_str() >= r2.start_str() && r1.end_str() <= r2.end_str()
}

fn ratio_str(range: &Range, mbr: &Range) -> f64 {
    if !overlap_str(range, mbr) {
        return 0.0;
    }
    if mbr.unary() {
        return 1.0;
    }

    let (m_start, m_end) = (mbr.start_str(), mbr.end_str());
    let pref = common_prefix_len(m_start, m_end);
    let char_at = |s: &[u8]| s.get(pref).copied().unwrap_or(0) as f64;
    let mbr_span = char_at(m_end) - char_at(m_start) + 1.0;

    let o_start = range.start_str().max(m_start);
    let o_end = range.end_str().min(m_end);
    let o_span = if o_start == o_end {
        1.0
    } else {
        char_at(o_end) - char_at(o_start) + 1.0
    };

    let ratio = o_span / mbr_span;
    if ratio >= 1.0 && (o_start != m_start || o_end != m_end) {
        return f64::from_bits(1.0f64.to_bits() - 1);
    }
    ratio.min(1.0)
}

fn expand_str(r1: &Range, r2: &mut Range) -> MemoryResult<()> {
    let start = r1.start_str().min(r2.start_str());
    let end = r1.end_str().max(r2.end_str());
    let expanded = Range::from_str_in(start, end, r2.allocator().clone())?;
    *r2 = expanded;
    Ok(())
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
