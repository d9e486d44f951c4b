//! Bitmap — bit-scan primitives and fixed slot allocation
//!
//! Every pool in the runtime tracks its live slots in a packed `u32`
//! bit vector. Allocation is find-first-clear + set, release is clear.
//! Bits at index >= the logical length are padding and never match.
//!
//! Author: Moroya Sakamoto

/// Bits per storage word
pub const WORD_BITS: usize = u32::BITS as usize;

/// Words needed to store `bits` bits
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// Word `i` of a `n`-bit vector, optionally inverted, padding masked off.
#[inline]
fn masked(words: &[u32], n: usize, i: usize, invert: bool) -> u32 {
    let w = if invert { !words[i] } else { words[i] };
    let valid = n - i * WORD_BITS;
    if valid >= WORD_BITS {
        w
    } else {
        w & ((1u32 << valid) - 1)
    }
}

fn scan_first(words: &[u32], n: usize, invert: bool) -> Option<usize> {
    let n = n.min(words.len() * WORD_BITS);
    (0..words_for(n)).find_map(|i| match masked(words, n, i, invert) {
        0 => None,
        w => Some(i * WORD_BITS + w.trailing_zeros() as usize),
    })
}

fn scan_last(words: &[u32], n: usize, invert: bool) -> Option<usize> {
    let n = n.min(words.len() * WORD_BITS);
    (0..words_for(n)).rev().find_map(|i| match masked(words, n, i, invert) {
        0 => None,
        w => Some(i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize)),
    })
}

/// Index of the lowest set bit among the first `n` bits
pub fn find_first_set(words: &[u32], n: usize) -> Option<usize> {
    scan_first(words, n, false)
}

/// Index of the highest set bit among the first `n` bits
pub fn find_last_set(words: &[u32], n: usize) -> Option<usize> {
    scan_last(words, n, false)
}

/// Index of the lowest clear bit among the first `n` bits
pub fn find_first_clear(words: &[u32], n: usize) -> Option<usize> {
    scan_first(words, n, true)
}

/// Index of the highest clear bit among the first `n` bits
pub fn find_last_clear(words: &[u32], n: usize) -> Option<usize> {
    scan_last(words, n, true)
}

/// Fixed-length bit vector backing a slot pool
///
/// `W` is the storage word count; the logical length is fixed at
/// construction and may be any value up to `W * 32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap<const W: usize> {
    words: [u32; W],
    len: usize,
}

impl<const W: usize> Bitmap<W> {
    /// Create an all-clear bitmap of `len` logical bits
    pub const fn new(len: usize) -> Self {
        assert!(len <= W * WORD_BITS, "bitmap length exceeds storage");
        Self { words: [0; W], len }
    }

    /// Logical bit count
    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / WORD_BITS] & (1 << (i % WORD_BITS)) != 0
    }

    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.words[i / WORD_BITS] |= 1 << (i % WORD_BITS);
        }
    }

    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / WORD_BITS] &= !(1 << (i % WORD_BITS));
        }
    }

    pub fn clear_all(&mut self) {
        self.words = [0; W];
    }

    pub fn first_set(&self) -> Option<usize> {
        find_first_set(&self.words, self.len)
    }

    pub fn last_set(&self) -> Option<usize> {
        find_last_set(&self.words, self.len)
    }

    pub fn first_clear(&self) -> Option<usize> {
        find_first_clear(&self.words, self.len)
    }

    pub fn last_clear(&self) -> Option<usize> {
        find_last_clear(&self.words, self.len)
    }

    /// Claim the lowest free slot
    pub fn acquire(&mut self) -> Option<usize> {
        let i = self.first_clear()?;
        self.set(i);
        Some(i)
    }

    /// Free a slot; returns whether it was in use
    pub fn release(&mut self, i: usize) -> bool {
        let was = self.get(i);
        self.clear(i);
        was
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn is_full(&self) -> bool {
        self.first_clear().is_none()
    }

    /// Iterate set bit indices, lowest first
    ///
    /// Walks word by word, skipping empty words and clear bits.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.len.min(W * WORD_BITS);
        (0..words_for(len)).flat_map(move |i| {
            let base = i * WORD_BITS;
            let mut w = masked(&self.words, len, i, false);
            core::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(base + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_scan(words: &[u32], n: usize, want: bool, last: bool) -> Option<usize> {
        let bit = |i: usize| words[i / WORD_BITS] & (1 << (i % WORD_BITS)) != 0;
        if last {
            (0..n).rev().find(|&i| bit(i) == want)
        } else {
            (0..n).find(|&i| bit(i) == want)
        }
    }

    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            self.0
        }
    }

    #[test]
    fn test_scans_match_reference() {
        let mut rng = Lcg(7);
        for n in 0..=96 {
            for round in 0..24 {
                let mut words = [0u32; 3];
                for w in words.iter_mut() {
                    *w = match round {
                        0 => 0,
                        1 => u32::MAX,
                        // sparse vectors exercise the "single bit" paths
                        r if r % 3 == 0 => 1 << (rng.next() % 32),
                        r if r % 3 == 1 => !(1 << (rng.next() % 32)),
                        _ => rng.next(),
                    };
                }
                assert_eq!(find_first_set(&words, n), reference_scan(&words, n, true, false));
                assert_eq!(find_last_set(&words, n), reference_scan(&words, n, true, true));
                assert_eq!(find_first_clear(&words, n), reference_scan(&words, n, false, false));
                assert_eq!(find_last_clear(&words, n), reference_scan(&words, n, false, true));
            }
        }
    }

    #[test]
    fn test_padding_never_matches() {
        // bits 5.. are set padding: a 5-bit vector of zeros has no set bit
        let words = [!0u32 << 5];
        assert_eq!(find_first_set(&words, 5), None);
        assert_eq!(find_last_set(&words, 5), None);
        assert_eq!(find_first_clear(&words, 5), Some(0));
        assert_eq!(find_last_clear(&words, 5), Some(4));
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(find_first_set(&[], 10), None);
        assert_eq!(find_first_clear(&[], 10), None);
        assert_eq!(find_last_clear(&[0], 0), None);
    }

    #[test]
    fn test_words_for() {
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(1), 1);
        assert_eq!(words_for(32), 1);
        assert_eq!(words_for(33), 2);
    }

    #[test]
    fn test_pool_never_aliases_live_slots() {
        let mut map = Bitmap::<2>::new(40);
        let mut live = [false; 40];
        let mut rng = Lcg(99);
        for _ in 0..2000 {
            if rng.next() % 3 != 0 {
                match map.acquire() {
                    Some(i) => {
                        assert!(!live[i], "slot {i} handed out twice");
                        live[i] = true;
                    }
                    None => assert!(live.iter().all(|&l| l)),
                }
            } else {
                let i = (rng.next() % 40) as usize;
                assert_eq!(map.release(i), live[i]);
                live[i] = false;
            }
            assert_eq!(map.count(), live.iter().filter(|&&l| l).count());
            assert!(map.count() <= map.len());
        }
    }

    #[test]
    fn test_acquire_reuses_lowest() {
        let mut map = Bitmap::<1>::new(4);
        assert_eq!(map.acquire(), Some(0));
        assert_eq!(map.acquire(), Some(1));
        assert_eq!(map.acquire(), Some(2));
        assert!(map.release(1));
        assert_eq!(map.acquire(), Some(1));
        assert_eq!(map.acquire(), Some(3));
        assert_eq!(map.acquire(), None);
        assert!(map.is_full());
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut map = Bitmap::<1>::new(3);
        map.set(3);
        assert!(!map.get(3));
        assert!(map.is_empty());
        assert!(!map.release(10));
    }

    #[test]
    fn test_iter_matches_bitwise_walk() {
        let mut rng = Lcg(3);
        for len in 0..=64 {
            let map = Bitmap::<2> {
                words: [rng.next(), rng.next() | 1 << 31],
                len,
            };
            let mut expected = (0..len).filter(|&i| map.get(i));
            for i in map.iter() {
                assert!(i < len, "padding bit {i} reported for len {len}");
                assert_eq!(Some(i), expected.next());
            }
            assert_eq!(expected.next(), None);
        }
    }

    #[test]
    fn test_iter_set_bits() {
        let mut map = Bitmap::<2>::new(64);
        map.set(1);
        map.set(33);
        map.set(63);
        let mut it = map.iter();
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next(), Some(33));
        assert_eq!(it.next(), Some(63));
        assert_eq!(it.next(), None);
        assert_eq!(map.last_set(), Some(63));
    }
}
