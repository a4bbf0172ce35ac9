//! Types for use as [crate::Read::Cfg].

use core::ops::{Bound, RangeBounds};

/// Inclusive/exclusive bounds on a decoded length.
///
/// # Examples
///
/// ```
/// use ocr_codec::RangeCfg;
///
/// let cfg = RangeCfg::from(0..=1024);
/// assert!(cfg.contains(&500));
/// assert!(!cfg.contains(&2000));
///
/// let cfg = RangeCfg::from(1..);
/// assert!(!cfg.contains(&0));
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RangeCfg {
    start: Bound<usize>,
    end: Bound<usize>,
}

impl RangeCfg {
    /// Create a new [RangeCfg] from any range over `usize`.
    pub fn new(r: impl RangeBounds<usize>) -> Self {
        Self {
            start: r.start_bound().cloned(),
            end: r.end_bound().cloned(),
        }
    }

    /// Accept exactly `value`.
    pub fn exact(value: usize) -> Self {
        Self {
            start: Bound::Included(value),
            end: Bound::Included(value),
        }
    }

    /// Returns true if `value` lies within the range.
    pub fn contains(&self, value: &usize) -> bool {
        match self.start {
            Bound::Included(s) if *value < s => return false,
            Bound::Excluded(s) if *value <= s => return false,
            _ => {}
        }
        match self.end {
            Bound::Included(e) if *value > e => return false,
            Bound::Excluded(e) if *value >= e => return false,
            _ => {}
        }
        true
    }

    /// The largest accepted value, if bounded.
    pub fn max(&self) -> Option<usize> {
        match self.end {
            Bound::Included(e) => Some(e),
            Bound::Excluded(e) => e.checked_sub(1),
            Bound::Unbounded => None,
        }
    }
}

impl RangeBounds<usize> for RangeCfg {
    fn start_bound(&self) -> Bound<&usize> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&usize> {
        self.end.as_ref()
    }
}

macro_rules! impl_from_range {
    ($($range:ty),*) => {
        $(
            impl From<$range> for RangeCfg {
                fn from(r: $range) -> Self {
                    Self::new(r)
                }
            }
        )*
    };
}

impl_from_range!(
    core::ops::Range<usize>,
    core::ops::RangeInclusive<usize>,
    core::ops::RangeFrom<usize>,
    core::ops::RangeTo<usize>,
    core::ops::RangeToInclusive<usize>,
    core::ops::RangeFull
);

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RangeCfg::from(..), 0, true; "unbounded")]
    #[test_case(RangeCfg::from(5..), 4, false; "below start")]
    #[test_case(RangeCfg::from(5..), 5, true; "at start")]
    #[test_case(RangeCfg::from(..10), 10, false; "exclusive end")]
    #[test_case(RangeCfg::from(..=10), 10, true; "inclusive end")]
    #[test_case(RangeCfg::exact(3), 3, true; "exact hit")]
    #[test_case(RangeCfg::exact(3), 4, false; "exact miss")]
    fn test_contains(cfg: RangeCfg, value: usize, expected: bool) {
        assert_eq!(cfg.contains(&value), expected);
    }

    #[test]
    fn test_max() {
        assert_eq!(RangeCfg::from(0..10).max(), Some(9));
        assert_eq!(RangeCfg::from(0..=10).max(), Some(10));
        assert_eq!(RangeCfg::from(0..0).max(), None);
        assert_eq!(RangeCfg::from(1..).max(), None);
    }
}
