//! Byte deque — fixed-capacity double-ended byte queue
//!
//! Backing store for queued events. Pushes are all-or-nothing so a
//! record is never split: a push either stores every byte or none.
//! No heap, never blocks.
//!
//! Author: Moroya Sakamoto

/// Fixed-size circular byte buffer with push/pop at both ends
pub struct ByteDeque<const N: usize> {
    /// Ring storage
    buffer: [u8; N],
    /// Index of the front byte
    head: usize,
    /// Stored byte count
    len: usize,
}

impl<const N: usize> ByteDeque<N> {
    /// Create an empty deque
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; N],
            head: 0,
            len: 0,
        }
    }

    /// Append `data` at the back
    ///
    /// Returns the bytes stored: `data.len()`, or 0 if it does not fit.
    pub fn push_back(&mut self, data: &[u8]) -> usize {
        if data.is_empty() || data.len() > self.free() {
            return 0;
        }
        let tail = self.head + self.len;
        for (i, &b) in data.iter().enumerate() {
            self.buffer[(tail + i) % N] = b;
        }
        self.len += data.len();
        data.len()
    }

    /// Prepend `data` at the front, keeping its byte order
    pub fn push_front(&mut self, data: &[u8]) -> usize {
        if data.is_empty() || data.len() > self.free() {
            return 0;
        }
        self.head = (self.head + N - data.len()) % N;
        for (i, &b) in data.iter().enumerate() {
            self.buffer[(self.head + i) % N] = b;
        }
        self.len += data.len();
        data.len()
    }

    /// Remove up to `out.len()` bytes from the front
    pub fn pop_front(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.buffer[(self.head + i) % N];
        }
        self.head = (self.head + n) % N;
        self.len -= n;
        n
    }

    /// Remove up to `out.len()` bytes from the back, keeping their order
    pub fn pop_back(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let start = self.head + self.len - n;
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.buffer[(start + i) % N];
        }
        self.len -= n;
        n
    }

    /// Bytes stored
    pub fn filled(&self) -> usize {
        self.len
    }

    /// Bytes that can still be pushed
    pub fn free(&self) -> usize {
        N - self.len
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Drop all bytes
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl<const N: usize> Default for ByteDeque<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_front() {
        let mut q = ByteDeque::<8>::new();
        assert!(q.is_empty());
        assert_eq!(q.push_back(&[1, 2, 3]), 3);
        assert_eq!(q.filled(), 3);

        let mut out = [0u8; 3];
        assert_eq!(q.pop_front(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_all_or_nothing_push() {
        let mut q = ByteDeque::<4>::new();
        assert_eq!(q.push_back(&[1, 2, 3]), 3);
        assert_eq!(q.push_back(&[4, 5]), 0); // only 1 byte free
        assert_eq!(q.filled(), 3);
        assert_eq!(q.push_back(&[4]), 1);
        assert!(q.is_full());
        assert_eq!(q.push_back(&[]), 0);
    }

    #[test]
    fn test_both_ends() {
        let mut q = ByteDeque::<8>::new();
        q.push_back(&[3, 4]);
        q.push_front(&[1, 2]);

        let mut back = [0u8; 1];
        assert_eq!(q.pop_back(&mut back), 1);
        assert_eq!(back, [4]);

        let mut rest = [0u8; 8];
        assert_eq!(q.pop_front(&mut rest), 3);
        assert_eq!(&rest[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_wraparound() {
        let mut q = ByteDeque::<5>::new();
        // Fill and drain repeatedly so head walks past the end
        for round in 0..4u8 {
            assert_eq!(q.push_back(&[round, round + 1, round + 2]), 3);
            let mut out = [0u8; 3];
            assert_eq!(q.pop_front(&mut out), 3);
            assert_eq!(out, [round, round + 1, round + 2]);
        }
    }

    #[test]
    fn test_short_pop() {
        let mut q = ByteDeque::<8>::new();
        q.push_back(&[9, 8]);
        let mut out = [0u8; 4];
        assert_eq!(q.pop_front(&mut out), 2);
        assert_eq!(q.pop_front(&mut out), 0);
    }

    #[test]
    fn test_clear() {
        let mut q = ByteDeque::<8>::new();
        q.push_back(&[1, 2]);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.free(), 8);
    }
}
