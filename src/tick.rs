//! Tick — host-driven monotonic tick counter
//!
//! The runtime never reads a clock. The host (SysTick ISR, RTOS thread,
//! test loop) calls `inc` and everything else is measured in ticks.
//! The counter is 32-bit and wraps; all comparisons use wrapping math.
//!
//! Author: Moroya Sakamoto

/// Tick count
pub type Tick = u32;

/// Tick counter
///
/// Size: 12 bytes
#[derive(Debug, Clone, Copy)]
pub struct TickCounter {
    /// Current tick
    count: Tick,
    /// Tick frequency (Hz)
    freq: u32,
    /// Number of times `count` wrapped past zero
    wraps: u32,
}

impl TickCounter {
    /// Create a counter at tick 0
    pub const fn new(freq: u32) -> Self {
        Self {
            count: 0,
            freq,
            wraps: 0,
        }
    }

    /// Advance by `n` ticks
    pub fn inc(&mut self, n: Tick) {
        let new = self.count.wrapping_add(n);
        if new < self.count {
            self.wraps += 1;
        }
        self.count = new;
    }

    /// Current tick
    pub fn count(&self) -> Tick {
        self.count
    }

    /// Ticks since `reference`, correct across one wrap
    pub fn elapsed(&self, reference: Tick) -> Tick {
        self.count.wrapping_sub(reference)
    }

    pub fn freq(&self) -> u32 {
        self.freq
    }

    pub fn wraps(&self) -> u32 {
        self.wraps
    }

    /// Milliseconds to ticks, rounded down, saturating
    pub fn ms_to_ticks(&self, ms: u32) -> Tick {
        let t = ms as u64 * self.freq as u64 / 1000;
        t.min(Tick::MAX as u64) as Tick
    }

    /// Ticks to milliseconds, rounded down
    pub fn ticks_to_ms(&self, ticks: Tick) -> u32 {
        if self.freq == 0 {
            return 0;
        }
        (ticks as u64 * 1000 / self.freq as u64).min(u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_elapsed() {
        let mut t = TickCounter::new(1000);
        t.inc(10);
        let mark = t.count();
        t.inc(25);
        assert_eq!(t.count(), 35);
        assert_eq!(t.elapsed(mark), 25);
    }

    #[test]
    fn test_wraparound() {
        let mut t = TickCounter::new(1000);
        t.inc(Tick::MAX - 4);
        let mark = t.count();
        t.inc(10);
        assert_eq!(t.count(), 5);
        assert_eq!(t.wraps(), 1);
        assert_eq!(t.elapsed(mark), 10);
    }

    #[test]
    fn test_ms_conversion() {
        let t = TickCounter::new(1000);
        assert_eq!(t.ms_to_ticks(250), 250);
        assert_eq!(t.ticks_to_ms(250), 250);

        let slow = TickCounter::new(100);
        assert_eq!(slow.ms_to_ticks(250), 25);
        assert_eq!(slow.ticks_to_ms(25), 250);
        assert_eq!(slow.ms_to_ticks(5), 0);
    }

    #[test]
    fn test_ms_conversion_saturates() {
        let t = TickCounter::new(1_000_000);
        assert_eq!(t.ms_to_ticks(u32::MAX), Tick::MAX);
        assert_eq!(TickCounter::new(0).ticks_to_ms(100), 0);
    }
}
