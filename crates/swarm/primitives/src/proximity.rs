use core::cmp::Ordering;

/// Proximity order of two byte strings: the number of leading bits they
/// share, capped at `max_po`.
///
/// The comparison is MSB first, so `0` means the first bit already differs.
pub fn proximity(one: &[u8], other: &[u8], max_po: u8) -> u8 {
    let bytes = (max_po as usize / 8 + 1).min(one.len()).min(other.len());
    for (i, (a, b)) in one.iter().zip(other).take(bytes).enumerate() {
        let oxo = a ^ b;
        if oxo != 0 {
            let po = i * 8 + oxo.leading_zeros() as usize;
            return po.min(max_po as usize) as u8;
        }
    }
    max_po
}

/// Compares `x` and `y` by XOR distance to `target`.
///
/// Returns `Ordering::Greater` if `x` is closer to `target` than `y`,
/// `Ordering::Less` if it is farther, and `Ordering::Equal` if both are the
/// same distance (which for equal length addresses means `x == y`).
pub fn distance_cmp(target: &[u8], x: &[u8], y: &[u8]) -> Ordering {
    for ((t, a), b) in target.iter().zip(x).zip(y) {
        let dx = a ^ t;
        let dy = b ^ t;
        if dx != dy {
            return if dx < dy {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HASH_SIZE, MAX_PO};

    fn right_padded(prefix: &[u8]) -> [u8; HASH_SIZE] {
        let mut out = [0u8; HASH_SIZE];
        out[..prefix.len()].copy_from_slice(prefix);
        out
    }

    #[test]
    fn test_proximity() {
        let base = [0u8; HASH_SIZE];
        let cases: Vec<(Vec<u8>, u8)> = vec![
            (vec![0b0000_0000, 0b0000_0000, 0b0000_0000], MAX_PO),
            (vec![0b1000_0000], 0),
            (vec![0b0100_0000], 1),
            (vec![0b0010_0000], 2),
            (vec![0b0000_0001], 7),
            (vec![0b0000_0000, 0b1000_0000], 8),
            (vec![0b0000_0000, 0b0000_0100], 13),
            (vec![0b0000_0000, 0b0000_0001], 15),
            (vec![0b0000_0000, 0b0000_0000, 0b1000_0000], 16),
            (vec![0b0000_0000, 0b0000_0000, 0b0000_0001], 16),
            (vec![0b0000_0000, 0b0000_0000, 0b0000_0000, 0b1000_0000], 16),
        ];

        for (prefix, expected) in cases {
            let addr = right_padded(&prefix);
            assert_eq!(proximity(&base, &addr, MAX_PO), expected, "prefix {prefix:?}");
            assert_eq!(proximity(&addr, &base, MAX_PO), expected, "prefix {prefix:?}");
        }
    }

    #[test]
    fn test_extended_proximity() {
        let base = [0u8; HASH_SIZE];
        let mut addr = [0u8; HASH_SIZE];
        addr[4] = 0b0001_0000;
        assert_eq!(proximity(&base, &addr, u8::MAX), 35);
        assert_eq!(proximity(&base, &base, u8::MAX), u8::MAX);
    }

    macro_rules! distance_cmp_test {
        ($test_name:ident, $ordering:expr, $a:expr, $x:expr, $y:expr) => {
            #[test]
            fn $test_name() {
                let a = right_padded(&[$a]);
                let x = right_padded(&[$x]);
                let y = right_padded(&[$y]);
                assert_eq!(distance_cmp(&a, &x, &y), $ordering);
            }
        };
    }

    distance_cmp_test!(distance_cmp_eq, Ordering::Equal, 0x91, 0x12, 0x12);
    distance_cmp_test!(distance_cmp_lt, Ordering::Less, 0x91, 0x12, 0x82);
    distance_cmp_test!(distance_cmp_gt, Ordering::Greater, 0x91, 0x82, 0x12);
}
