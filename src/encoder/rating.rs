//! Rating buckets.
//!
//! Ratings below 1100 share bucket 0, each 100 points from 1100 to 1999 get
//! their own bucket (1 to 9), and everything from 2000 up is bucket 10.

use std::fmt;

use once_cell::sync::Lazy;

/// Lowest rating with its own bucket
const FIRST_EDGE: i64 = 1100;
/// Ratings at or above this share the top bucket
const TOP_EDGE: i64 = 2000;
const WIDTH: i64 = 100;

/// Number of rating buckets
pub const RATING_BUCKETS: usize = 11;

/// Index into the rating embedding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RatingBucket(u8);

impl RatingBucket {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Rating range `[low, high)` covered by this bucket; open ends are `None`.
    #[must_use]
    pub fn range(self) -> (Option<i64>, Option<i64>) {
        RATING_TABLE[self.index()]
    }
}

impl fmt::Display for RatingBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range() {
            (None, Some(high)) => write!(f, "<{high}"),
            (Some(low), None) => write!(f, ">={low}"),
            (Some(low), Some(high)) => write!(f, "{low}-{}", high - 1),
            (None, None) => f.write_str("any"),
        }
    }
}

/// Bucket boundaries, built once on first use.
static RATING_TABLE: Lazy<[(Option<i64>, Option<i64>); RATING_BUCKETS]> = Lazy::new(|| {
    let mut table = [(None, None); RATING_BUCKETS];
    table[0] = (None, Some(FIRST_EDGE));
    for (k, entry) in table.iter_mut().enumerate().take(RATING_BUCKETS - 1).skip(1) {
        let low = FIRST_EDGE + WIDTH * (k as i64 - 1);
        *entry = (Some(low), Some(low + WIDTH));
    }
    table[RATING_BUCKETS - 1] = (Some(TOP_EDGE), None);
    table
});

/// Bucket for `rating`. Total over all integers and monotonic.
#[must_use]
pub fn bucket_for(rating: i64) -> RatingBucket {
    let index = RATING_TABLE
        .iter()
        .position(|&(low, high)| low.map_or(true, |l| rating >= l) && high.map_or(true, |h| rating < h))
        .unwrap_or(RATING_BUCKETS - 1);
    RatingBucket(index as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_edges() {
        assert_eq!(bucket_for(1).index(), 0);
        assert_eq!(bucket_for(1099).index(), 0);
        assert_eq!(bucket_for(1100).index(), 1);
        assert_eq!(bucket_for(1199).index(), 1);
        assert_eq!(bucket_for(1500).index(), 5);
        assert_eq!(bucket_for(1999).index(), 9);
        assert_eq!(bucket_for(2000).index(), 10);
        assert_eq!(bucket_for(3200).index(), 10);
    }

    #[test]
    fn test_table_is_contiguous() {
        for k in 0..RATING_BUCKETS - 1 {
            assert_eq!(RATING_TABLE[k].1, RATING_TABLE[k + 1].0);
        }
        assert_eq!(RATING_TABLE[0].0, None);
        assert_eq!(RATING_TABLE[RATING_BUCKETS - 1].1, None);
    }

    #[test]
    fn test_display() {
        assert_eq!(bucket_for(900).to_string(), "<1100");
        assert_eq!(bucket_for(1550).to_string(), "1500-1599");
        assert_eq!(bucket_for(2400).to_string(), ">=2000");
    }
}
