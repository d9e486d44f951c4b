//! Kernel — top-level runtime manager
//!
//! Owns every pool (timers, subscribers, tasks, event ids) plus the
//! application state `A` that task bodies and callbacks work on. This is
//! the context object all callbacks receive, so a timer callback can
//! publish an event and an event callback can resume a task.
//!
//! Typical host loop:
//! ```ignore
//! loop {
//!     let sleep = kernel.handler();
//!     kernel.dispatch();
//!     wait_for_tick_interrupts(sleep); // ISR calls kernel.tick_inc(1)
//! }
//! ```
//!
//! Author: Moroya Sakamoto

use log::debug;

use crate::bus::{self, BusContext, EventBus};
use crate::config::RuntimeConfig;
use crate::error::{fatal, Fatal, Result};
use crate::event::{EventId, EventIdPool};
use crate::scheduler::{run_pass, Scheduler};
use crate::tick::Tick;
use crate::timer::{self, TimerContext, TimerPool, TIMER_INFINITY};

/// Runtime kernel
///
/// Memory footprint is fixed at compile time by the pool capacities in
/// [`crate::config`]; nothing is allocated after construction.
pub struct Kernel<A = ()> {
    /// Software timers and the tick counter
    pub timers: TimerPool<Kernel<A>>,
    /// Subscribers and queued events
    pub bus: EventBus<Kernel<A>>,
    /// Unique event id allocator
    pub event_ids: EventIdPool,
    /// Task table
    pub(crate) scheduler: Scheduler<A>,
    config: RuntimeConfig,
    /// Kernel state
    running: bool,
    /// Application state shared by all tasks and callbacks
    pub app: A,
}

impl<A> Kernel<A> {
    pub fn new(app: A, config: RuntimeConfig) -> Self {
        let mut timers: TimerPool<Self> = TimerPool::new(&config);
        let sched_timer = match timers.create(TIMER_INFINITY, run_pass::<A>, 0) {
            Ok(id) => id,
            Err(_) => fatal(Fatal::PoolExhausted),
        };
        debug!("kernel up, {} Hz tick", config.tick_freq);
        Self {
            timers,
            bus: EventBus::new(),
            event_ids: EventIdPool::new(),
            scheduler: Scheduler::new(sched_timer, &config),
            config,
            running: false,
            app,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Task table (read-only diagnostics)
    pub fn scheduler(&self) -> &Scheduler<A> {
        &self.scheduler
    }

    /// Advance the tick counter; call from the tick interrupt or loop
    pub fn tick_inc(&mut self, n: Tick) {
        self.timers.tick_inc(n);
    }

    /// Current tick
    pub fn now(&self) -> Tick {
        self.timers.now()
    }

    /// Fire due timers (including the scheduler pass)
    ///
    /// Returns the number of ticks the host may sleep.
    pub fn handler(&mut self) -> Tick {
        timer::handler(self)
    }

    /// Advance time by `delta` ticks and run the timer handler
    pub fn tick(&mut self, delta: Tick) -> Tick {
        self.tick_inc(delta);
        self.handler()
    }

    /// Deliver queued events; returns callbacks invoked
    pub fn dispatch(&mut self) -> usize {
        bus::dispatch(self)
    }

    /// Queue an event for the next dispatch
    pub fn publish(&mut self, event: EventId, arg: usize) -> Result<()> {
        self.bus.publish(event, arg)
    }

    /// Deliver an event right now
    pub fn publish_immediate(&mut self, event: EventId, arg: usize) -> Result<usize> {
        bus::publish_immediate(self, event, arg)
    }

    pub fn idle_percentage(&self) -> u8 {
        self.timers.idle_percentage()
    }

    /// Run the host loop for `total` ticks (testing)
    ///
    /// Sleeps are simulated by advancing the tick straight to the next
    /// wakeup, at least one tick at a time.
    pub fn run_for(&mut self, total: Tick) -> KernelStats {
        self.running = true;
        let start = self.now();
        let passes = self.scheduler.passes();
        let mut handler_calls = 0u32;
        let mut delivered = 0usize;

        while self.running {
            self.handler();
            handler_calls += 1;
            delivered += self.dispatch();

            let elapsed = self.timers.ticks().elapsed(start);
            if elapsed >= total {
                break;
            }
            let sleep = self.timers.next_wakeup();
            self.tick_inc(sleep.clamp(1, total - elapsed));
        }

        self.running = false;
        KernelStats {
            ticks: self.timers.ticks().elapsed(start),
            handler_calls,
            passes: self.scheduler.passes() - passes,
            delivered,
            idle_percent: self.idle_percentage(),
        }
    }

    /// Stop `run_for` after the current iteration
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Is the kernel running?
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Memory footprint estimate
    pub fn memory_footprint(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

impl<A: Default> Default for Kernel<A> {
    fn default() -> Self {
        Self::new(A::default(), RuntimeConfig::default())
    }
}

impl<A> TimerContext for Kernel<A> {
    fn timers(&mut self) -> &mut TimerPool<Self> {
        &mut self.timers
    }
}

impl<A> BusContext for Kernel<A> {
    fn bus(&mut self) -> &mut EventBus<Self> {
        &mut self.bus
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone)]
pub struct KernelStats {
    /// Ticks elapsed
    pub ticks: Tick,
    /// Timer handler invocations
    pub handler_calls: u32,
    /// Scheduler passes
    pub passes: u32,
    /// Event callbacks invoked by dispatch
    pub delivered: usize,
    /// Idle share of the last measurement window
    pub idle_percent: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;
    use crate::suspend;
    use crate::task::{TaskId, TaskState};
    use crate::timer::TimerId;

    const PING: EventId = EventId(1);

    #[derive(Default)]
    struct Counters {
        ticks_seen: u32,
        pings: u32,
        last_arg: usize,
        runs: u32,
    }

    fn on_tick(k: &mut Kernel<Counters>, _timer: TimerId, _: usize) {
        k.app.ticks_seen += 1;
        let n = k.app.ticks_seen as usize;
        let _ = k.publish(PING, n);
    }

    fn on_ping(k: &mut Kernel<Counters>, d: Delivery) {
        k.app.pings += 1;
        k.app.last_arg = d.arg;
    }

    fn spinner(k: &mut Kernel<Counters>, me: TaskId) -> TaskState {
        k.app.runs += 1;
        if k.app.runs == 5 {
            k.stop();
        }
        suspend!(k.yield_now(me, 0));
        k.finish(me)
    }

    #[test]
    fn test_kernel_creation() {
        let kernel = Kernel::<()>::default();
        assert_eq!(kernel.scheduler().task_count(), 0);
        // the scheduler's own timer
        assert_eq!(kernel.timers.count(), 1);
        assert_eq!(kernel.now(), 0);
        assert!(!kernel.is_running());
    }

    #[test]
    fn test_timer_to_event_pipeline() {
        let mut k = Kernel::<Counters>::default();
        k.timers.create(10, on_tick, 0).unwrap();
        k.bus.subscribe(PING, on_ping, 0).unwrap();

        let stats = k.run_for(100);
        assert_eq!(k.app.ticks_seen, 10);
        assert_eq!(k.app.pings, 10);
        assert_eq!(k.app.last_arg, 10);
        assert_eq!(stats.delivered, 10);
        assert_eq!(stats.ticks, 100);
    }

    #[test]
    fn test_run_for_sleeps_between_wakeups() {
        let mut k = Kernel::<Counters>::default();
        k.timers.create(25, on_tick, 0).unwrap();
        let stats = k.run_for(100);
        // wakes at 0, 25, 50, 75, 100 only
        assert_eq!(stats.handler_calls, 5);
        assert_eq!(k.app.ticks_seen, 4);
    }

    #[test]
    fn test_stop_from_task() {
        let mut k = Kernel::<Counters>::default();
        k.create_task(spinner, 0).unwrap();
        let stats = k.run_for(1000);
        assert_eq!(k.app.runs, 5);
        assert!(stats.ticks < 1000);
        assert_eq!(stats.passes, 5);
        assert!(!k.is_running());
    }

    #[test]
    fn test_event_ids_from_kernel() {
        let mut k = Kernel::<Counters>::default();
        let id = k.event_ids.acquire().unwrap();
        k.bus.subscribe(id, on_ping, 0).unwrap();
        assert_eq!(k.publish_immediate(id, 42), Ok(1));
        assert_eq!(k.app.last_arg, 42);
    }

    #[test]
    fn test_idle_when_nothing_to_do() {
        let mut k = Kernel::<()>::default();
        let stats = k.run_for(5000);
        assert_eq!(stats.idle_percent, 100);
        // idle wakeups only, every idle_delay ticks
        assert_eq!(stats.handler_calls, 6);
    }

    #[test]
    fn test_memory_footprint() {
        let kernel = Kernel::<()>::default();
        let size = kernel.memory_footprint();
        assert!(size < 8192, "kernel size should be < 8KB, got {size}");
    }
}
