//! Config — pool capacities and runtime knobs
//!
//! Capacities are compile-time: every pool is a fixed array sized here.
//! Timing knobs live in [`RuntimeConfig`] and are handed to the kernel once.
//!
//! Author: Moroya Sakamoto

/// Maximum tasks (top-level and subtasks combined)
pub const TASK_NUM_MAX: usize = 16;

/// Maximum software timers, including the scheduler's own timer
pub const STIMER_NUM_MAX: usize = 16;

/// Maximum event subscribers
pub const SUBSCRIBER_NUM_MAX: usize = 16;

/// Event ids a single subscriber may listen to
pub const SUBSCR_ID_LIST_NUM_MAX: usize = 2;

/// Messages the event queue holds before `publish` reports full
pub const EVENT_QUEUE_NUM_MAX: usize = 16;

/// Unique event ids handed out by the event id allocator
pub const EVENT_ID_NUM_MAX: usize = 128;

/// First id returned by the event id allocator
pub const EVENT_ID_OFFSET: u16 = 32768;

// Slot ids are u8 and u8::MAX stays free as "no object".
const _: () = assert!(TASK_NUM_MAX < u8::MAX as usize);
const _: () = assert!(STIMER_NUM_MAX < u8::MAX as usize);
const _: () = assert!(SUBSCRIBER_NUM_MAX < u8::MAX as usize);
const _: () = assert!(SUBSCR_ID_LIST_NUM_MAX > 0);
const _: () = assert!(EVENT_ID_OFFSET as usize + EVENT_ID_NUM_MAX < u16::MAX as usize);

/// Runtime timing configuration
///
/// Defaults: 1 kHz tick, idle wakeup every 1000 ticks, 500-tick idle
/// measurement window, 100 handler calls before a frozen tick is fatal,
/// 6 levels of nested task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RuntimeConfig {
    /// Tick frequency (Hz)
    pub tick_freq: u32,
    /// Delay returned by the timer handler when nothing is pending
    pub idle_delay: u32,
    /// Busy/idle measurement window (ticks)
    pub idle_window: u32,
    /// Handler calls tolerated while the tick is still zero
    pub tick_stuck_limit: u32,
    /// Deepest allowed nesting of task body invocations
    pub nest_depth_max: u8,
}

impl RuntimeConfig {
    pub const fn new() -> Self {
        Self {
            tick_freq: 1000,
            idle_delay: 1000,
            idle_window: 500,
            tick_stuck_limit: 100,
            nest_depth_max: 6,
        }
    }

    pub const fn with_tick_freq(mut self, hz: u32) -> Self {
        self.tick_freq = hz;
        self
    }

    pub const fn with_idle_delay(mut self, ticks: u32) -> Self {
        self.idle_delay = ticks;
        self
    }

    pub const fn with_idle_window(mut self, ticks: u32) -> Self {
        self.idle_window = ticks;
        self
    }

    pub const fn with_tick_stuck_limit(mut self, calls: u32) -> Self {
        self.tick_stuck_limit = calls;
        self
    }

    pub const fn with_nest_depth_max(mut self, depth: u8) -> Self {
        self.nest_depth_max = depth;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
