use bytes::{Buf, BufMut};

use crate::IntervalError;

/// Canonical union of closed ranges over `[1, u64::MAX]`.
///
/// Ranges are kept sorted, disjoint and non-adjacent: adding `[6, 6]` to
/// `[[1, 5], [7, 9]]` yields `[[1, 9]]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Intervals {
    ranges: Vec<(u64, u64)>,
}

impl Intervals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the closed range `[start, end]`.
    ///
    /// Index `0` is outside the domain and is clamped away; a range that is
    /// empty after clamping is ignored.
    pub fn add(&mut self, start: u64, end: u64) {
        let start = start.max(1);
        if end < start {
            return;
        }

        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(s, e) in &self.ranges {
            if e.saturating_add(1) < merged.0 {
                out.push((s, e));
            } else if merged.1.saturating_add(1) < s {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Returns the first gap at or above `max(1, ceil)`.
    ///
    /// The result is `(start, end, empty)`: `start` is the smallest uncovered
    /// index, `end` is the last index of the gap or `0` when the gap is
    /// unbounded, and `empty` is true only when every index up to `u64::MAX`
    /// is covered.
    pub fn next(&self, ceil: u64) -> (u64, u64, bool) {
        let mut start = ceil.max(1);
        for &(s, e) in &self.ranges {
            if e < start {
                continue;
            }
            if s <= start {
                match e.checked_add(1) {
                    Some(next) => start = next,
                    None => return (u64::MAX, u64::MAX, true),
                }
                continue;
            }
            return (start, s - 1, false);
        }
        (start, 0, false)
    }

    /// End of the last range, `0` when empty.
    pub fn last(&self) -> u64 {
        self.ranges.last().map_or(0, |&(_, e)| e)
    }

    /// Returns true if `index` is covered.
    pub fn contains(&self, index: u64) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= index && index <= e)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Stable byte encoding: big endian `u32` count then `(start, end)` pairs.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.ranges.len() * 16);
        buf.put_u32(self.ranges.len() as u32);
        for &(s, e) in &self.ranges {
            buf.put_u64(s);
            buf.put_u64(e);
        }
        buf
    }

    /// Decodes [`Intervals::encode`] output, rejecting non-canonical input.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, IntervalError> {
        if bytes.remaining() < 4 {
            return Err(IntervalError::Truncated);
        }
        let count = bytes.get_u32() as usize;
        if bytes.remaining() != count.saturating_mul(16) {
            return Err(IntervalError::Truncated);
        }

        let mut ranges = Vec::with_capacity(count);
        let mut prev_end: Option<u64> = None;
        for _ in 0..count {
            let (s, e) = (bytes.get_u64(), bytes.get_u64());
            let ordered = prev_end.is_none_or(|p| p.saturating_add(1) < s);
            if s == 0 || e < s || !ordered {
                return Err(IntervalError::NotCanonical { start: s, end: e });
            }
            prev_end = Some(e);
            ranges.push((s, e));
        }
        Ok(Self { ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn from(ranges: &[(u64, u64)]) -> Intervals {
        let mut i = Intervals::new();
        for &(s, e) in ranges {
            i.add(s, e);
        }
        i
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let i = from(&[(1, 5), (7, 9), (6, 6)]);
        assert_eq!(i.ranges(), &[(1, 9)]);
        assert_eq!(i.next(0), (10, 0, false));
    }

    #[test]
    fn test_next_gap() {
        let i = from(&[(1, 5), (10, 20)]);
        assert_eq!(i.next(0), (6, 9, false));
        assert_eq!(i.next(7), (7, 9, false));
        assert_eq!(i.next(12), (21, 0, false));
        assert_eq!(Intervals::new().next(0), (1, 0, false));
        assert_eq!(from(&[(3, 4)]).next(0), (1, 2, false));
    }

    #[test]
    fn test_next_when_fully_covered() {
        let i = from(&[(1, u64::MAX)]);
        let (_, _, empty) = i.next(0);
        assert!(empty);
    }

    #[test]
    fn test_add_ignores_empty_and_zero() {
        let mut i = Intervals::new();
        i.add(5, 4);
        assert!(i.is_empty());
        i.add(0, 0);
        assert!(i.is_empty());
        i.add(0, 3);
        assert_eq!(i.ranges(), &[(1, 3)]);
    }

    #[test]
    fn test_add_spanning_many() {
        let i = from(&[(2, 3), (6, 7), (10, 11), (1, 12)]);
        assert_eq!(i.ranges(), &[(1, 12)]);
        assert_eq!(i.last(), 12);
        assert!(i.contains(7));
        assert!(!i.contains(13));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_matches!(Intervals::decode(&[0, 0]), Err(IntervalError::Truncated));

        let mut overlapping = Vec::new();
        overlapping.put_u32(2);
        for v in [1u64, 5, 6, 8] {
            overlapping.put_u64(v);
        }
        assert_matches!(
            Intervals::decode(&overlapping),
            Err(IntervalError::NotCanonical { start: 6, end: 8 })
        );
    }

    #[test]
    fn test_encode_decode() {
        let i = from(&[(1, 5), (10, 20), (40, 40)]);
        assert_eq!(Intervals::decode(&i.encode()).unwrap(), i);
        assert_eq!(Intervals::decode(&Intervals::new().encode()).unwrap(), Intervals::new());
    }

    fn ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
        proptest::collection::vec((1u64..200, 0u64..20).prop_map(|(s, len)| (s, s + len)), 0..20)
    }

    proptest! {
        #[test]
        fn prop_add_is_idempotent(input in ranges()) {
            let once = from(&input);
            let mut twice = once.clone();
            for &(s, e) in &input {
                twice.add(s, e);
            }
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_canonical_and_covering(input in ranges()) {
            let i = from(&input);
            for w in i.ranges().windows(2) {
                prop_assert!(w[0].1 + 1 < w[1].0);
            }
            for &(s, e) in &input {
                for x in s..=e {
                    prop_assert!(i.contains(x));
                }
            }
            let (gap, _, _) = i.next(0);
            prop_assert!(!i.contains(gap));
        }

        #[test]
        fn prop_order_independent(mut input in ranges()) {
            let forward = from(&input);
            input.reverse();
            prop_assert_eq!(forward, from(&input));
        }
    }
}
