use tilestore_memory::pmr::TryCloneIn;
use tilestore_memory::MemoryResult;

use crate::dimension::Dimension;
use crate::range::NDRange;

/// An ordered set of dimensions.
#[derive(Debug)]
pub struct Domain {
    dimensions: Vec<Dimension>,
}

impl Domain {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Domain { dimensions }
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimension_ptr(&self, d: usize) -> Option<&Dimension> {
        self.dimensions.get(d)
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// True if `a` and `b` intersect on every dimension.
    pub fn overlap(&self, a: &NDRange, b: &NDRange) -> bool {
        self.dimensions.iter().enumerate().all(|(d, dim)| {
            match (a.get(d), b.get(d)) {
                (Some(r1), Some(r2)) => dim.overlap(r1, r2),
                _ => false,
            }
        })
    }

    /// True if `a` lies within `b` on every dimension.
    pub fn covered(&self, a: &NDRange, b: &NDRange) -> bool {
        self.dimensions.iter().enumerate().all(|(d, dim)| {
            match (a.get(d), b.get(d)) {
                (Some(r1), Some(r2)) => dim.covered(r1, r2),
                _ => false,
            }
        })
    }

    /// Product of the per-dimension overlap ratios of `range` against `mbr`.
    ///
    /// Dimensions flagged in `is_default` are skipped. Returns 0 as soon as
    /// one dimension does not overlap. A product that underflows to 0 is
    /// clamped to the smallest positive double, so a real overlap is never
    /// reported as none.
    pub fn overlap_ratio(&self, range: &NDRange, is_default: &[bool], mbr: &NDRange) -> f64 {
        let mut ratio = 1.0;
        for (d, dim) in self.dimensions.iter().enumerate() {
            if is_default.get(d).copied().unwrap_or(false) {
                continue;
            }
            let (Some(r), Some(m)) = (range.get(d), mbr.get(d)) else {
                return 0.0;
            };
            if !dim.overlap(r, m) {
                return 0.0;
            }
            ratio *= dim.overlap_ratio(r, m);
            if ratio == 0.0 {
                ratio = f64::from_bits(1);
            }
        }
        ratio
    }

    /// Grows `r2` to cover `r1`. An empty `r2` becomes a copy of `r1` in
    /// `r2`'s allocator.
    pub fn expand_ndrange(&self, r1: &NDRange, r2: &mut NDRange) -> MemoryResult<()> {
        if r2.is_empty() {
            let copy = r1.try_clone_in(r2.allocator())?;
            *r2 = copy;
            return Ok(());
        }
        for (d, dim) in self.dimensions.iter().enumerate() {
            if let (Some(src), Some(dst)) = (r1.get(d), r2.get_mut(d)) {
                dim.expand_range(src, dst)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::range::{ndrange_in, Range};
    use tilestore_memory::pmr::Allocator;

    fn domain_2d() -> Domain {
        Domain::new(vec![
            Dimension::new("d1", Datatype::Int64)
                .with_domain(1i64, 1000i64)
                .unwrap(),
            Dimension::new("d2", Datatype::Int64)
                .with_domain(1i64, 1000i64)
                .unwrap(),
        ])
    }

    fn rect(x0: i64, x1: i64, y0: i64, y1: i64) -> NDRange {
        let alloc = Allocator::default();
        ndrange_in(
            [
                Range::from_values_in(x0, x1, alloc.clone()).unwrap(),
                Range::from_values_in(y0, y1, alloc.clone()).unwrap(),
            ],
            alloc,
        )
        .unwrap()
    }

    #[test]
    fn overlap_ratio_2d() {
        let domain = domain_2d();
        let mbr = rect(5, 10, 2, 9);
        let no_default = [false, false];
        assert_eq!(domain.overlap_ratio(&rect(6, 7, 10, 12), &no_default, &mbr), 0.0);
        assert_eq!(domain.overlap_ratio(&rect(4, 11, 2, 9), &no_default, &mbr), 1.0);
        assert_eq!(
            domain.overlap_ratio(&rect(7, 11, 4, 5), &no_default, &mbr),
            (4.0 / 6.0) * (2.0 / 8.0)
        );
    }

    #[test]
    fn default_dimensions_are_skipped() {
        let domain = domain_2d();
        let mbr = rect(5, 10, 2, 9);
        assert_eq!(
            domain.overlap_ratio(&rect(7, 11, 500, 600), &[false, true], &mbr),
            4.0 / 6.0
        );
    }

    #[test]
    fn overlap_and_covered() {
        let domain = domain_2d();
        assert!(domain.overlap(&rect(1, 5, 1, 5), &rect(5, 9, 5, 9)));
        assert!(!domain.overlap(&rect(1, 5, 1, 4), &rect(5, 9, 5, 9)));
        assert!(domain.covered(&rect(6, 7, 6, 7), &rect(5, 9, 5, 9)));
        assert!(!domain.covered(&rect(6, 7, 6, 10), &rect(5, 9, 5, 9)));
    }

    #[test]
    fn expand_from_empty() {
        let domain = domain_2d();
        let mut acc = NDRange::new_in(Allocator::default());
        domain.expand_ndrange(&rect(5, 10, 2, 9), &mut acc).unwrap();
        domain.expand_ndrange(&rect(1, 3, 7, 20), &mut acc).unwrap();
        assert_eq!(acc, rect(1, 10, 2, 20));
    }
}
