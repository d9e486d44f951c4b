//! Software timers — per-object wakeups on top of the tick counter
//!
//! A fixed pool of timers, each a `(last_fire, period)` pair. Nothing is
//! stored about being "due": the handler computes it from the tick.
//! [`handler`] fires everything due, in slot order, and returns how long
//! the host may sleep before calling it again.
//!
//! Callbacks receive the whole context (`&mut C`) so they may create or
//! destroy timers, publish events or resume tasks while the pass runs.
//!
//! Author: Moroya Sakamoto

use log::{debug, trace};

use crate::bitmap::{words_for, Bitmap};
use crate::config::{RuntimeConfig, STIMER_NUM_MAX};
use crate::error::{fatal, Error, Fatal, Pool, Result};
use crate::tick::{Tick, TickCounter};

/// Period of a timer that never fires
pub const TIMER_INFINITY: Tick = Tick::MAX;

const TIMER_WORDS: usize = words_for(STIMER_NUM_MAX);

/// Timer slot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u8);

impl TimerId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Timer callback: `(context, firing timer, user data)`
pub type TimerCallback<C> = fn(&mut C, TimerId, usize);

/// How many times a timer fires before releasing itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    /// Remaining fires; the slot is released as the last one starts
    Times(u32),
}

struct Timer<C> {
    callback: Option<TimerCallback<C>>,
    user_data: usize,
    last: Tick,
    period: Tick,
    repeat: Repeat,
}

impl<C> Timer<C> {
    const fn empty() -> Self {
        Self {
            callback: None,
            user_data: 0,
            last: 0,
            period: TIMER_INFINITY,
            repeat: Repeat::Forever,
        }
    }
}

impl<C> Clone for Timer<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Timer<C> {}

/// Rolling busy/idle measurement
struct IdleMeter {
    window: Tick,
    window_start: Tick,
    busy: Tick,
    idle_percent: u8,
}

/// Something that owns a timer pool for callbacks of its own type
pub trait TimerContext: Sized {
    fn timers(&mut self) -> &mut TimerPool<Self>;
}

/// Software timer pool
pub struct TimerPool<C> {
    slots: [Timer<C>; STIMER_NUM_MAX],
    used: Bitmap<TIMER_WORDS>,
    /// Slots already fired in the running pass
    fired: Bitmap<TIMER_WORDS>,
    /// Set whenever a slot is acquired or released
    changed: bool,
    ticks: TickCounter,
    idle_delay: Tick,
    stuck_calls: u32,
    stuck_limit: u32,
    meter: IdleMeter,
}

impl<C> TimerPool<C> {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            slots: [Timer::empty(); STIMER_NUM_MAX],
            used: Bitmap::new(STIMER_NUM_MAX),
            fired: Bitmap::new(STIMER_NUM_MAX),
            changed: false,
            ticks: TickCounter::new(config.tick_freq),
            idle_delay: config.idle_delay,
            stuck_calls: 0,
            stuck_limit: config.tick_stuck_limit,
            meter: IdleMeter {
                window: config.idle_window.max(1),
                window_start: 0,
                busy: 0,
                idle_percent: 100,
            },
        }
    }

    /// Advance the tick counter; this is the host's tick source hook
    pub fn tick_inc(&mut self, n: Tick) {
        self.ticks.inc(n);
    }

    pub fn now(&self) -> Tick {
        self.ticks.count()
    }

    pub fn ticks(&self) -> &TickCounter {
        &self.ticks
    }

    /// Claim an inert slot (no callback, infinite period)
    pub fn acquire(&mut self) -> Result<TimerId> {
        let idx = self.used.acquire().ok_or(Error::Exhausted(Pool::Timer))?;
        self.slots[idx] = Timer {
            last: self.ticks.count(),
            ..Timer::empty()
        };
        self.changed = true;
        Ok(TimerId(idx as u8))
    }

    /// Free a slot and zero its record
    pub fn release(&mut self, id: TimerId) -> Result<()> {
        if !self.used.release(id.index()) {
            return Err(Error::NotFound);
        }
        self.slots[id.index()] = Timer::empty();
        self.fired.clear(id.index());
        self.changed = true;
        Ok(())
    }

    /// Periodic timer, first due `period` ticks from now
    pub fn create(&mut self, period: Tick, callback: TimerCallback<C>, user_data: usize) -> Result<TimerId> {
        self.create_with(period, Repeat::Forever, callback, user_data)
    }

    /// Fires once, then releases itself
    pub fn create_oneshot(&mut self, period: Tick, callback: TimerCallback<C>, user_data: usize) -> Result<TimerId> {
        self.create_with(period, Repeat::Times(1), callback, user_data)
    }

    pub fn create_with(
        &mut self,
        period: Tick,
        repeat: Repeat,
        callback: TimerCallback<C>,
        user_data: usize,
    ) -> Result<TimerId> {
        if repeat == Repeat::Times(0) {
            return Err(Error::InvalidArg);
        }
        let id = self.acquire()?;
        let slot = &mut self.slots[id.index()];
        slot.callback = Some(callback);
        slot.user_data = user_data;
        slot.period = period;
        slot.repeat = repeat;
        debug!("timer {} created, period {}", id.index(), period);
        Ok(id)
    }

    pub fn destroy(&mut self, id: TimerId) -> Result<()> {
        self.release(id)?;
        debug!("timer {} destroyed", id.index());
        Ok(())
    }

    pub fn is_live(&self, id: TimerId) -> bool {
        self.used.get(id.index())
    }

    /// Live timer count
    pub fn count(&self) -> usize {
        self.used.count()
    }

    fn slot_mut(&mut self, id: TimerId) -> Result<&mut Timer<C>> {
        if !self.used.get(id.index()) {
            return Err(Error::NotFound);
        }
        Ok(&mut self.slots[id.index()])
    }

    fn slot(&self, id: TimerId) -> Result<&Timer<C>> {
        if !self.used.get(id.index()) {
            return Err(Error::NotFound);
        }
        Ok(&self.slots[id.index()])
    }

    pub fn set_period(&mut self, id: TimerId, period: Tick) -> Result<()> {
        self.slot_mut(id)?.period = period;
        Ok(())
    }

    pub fn set_callback(&mut self, id: TimerId, callback: TimerCallback<C>) -> Result<()> {
        self.slot_mut(id)?.callback = Some(callback);
        Ok(())
    }

    pub fn set_user_data(&mut self, id: TimerId, user_data: usize) -> Result<()> {
        self.slot_mut(id)?.user_data = user_data;
        Ok(())
    }

    pub fn set_repeat(&mut self, id: TimerId, repeat: Repeat) -> Result<()> {
        if repeat == Repeat::Times(0) {
            return Err(Error::InvalidArg);
        }
        self.slot_mut(id)?.repeat = repeat;
        Ok(())
    }

    /// Make the timer due on the next handler pass
    pub fn set_ready(&mut self, id: TimerId) -> Result<()> {
        let now = self.ticks.count();
        let slot = self.slot_mut(id)?;
        slot.last = now.wrapping_sub(slot.period).wrapping_sub(1);
        Ok(())
    }

    /// Restart the current period from now
    pub fn reset(&mut self, id: TimerId) -> Result<()> {
        let now = self.ticks.count();
        self.slot_mut(id)?.last = now;
        Ok(())
    }

    pub fn period(&self, id: TimerId) -> Result<Tick> {
        Ok(self.slot(id)?.period)
    }

    pub fn user_data(&self, id: TimerId) -> Result<usize> {
        Ok(self.slot(id)?.user_data)
    }

    /// Ticks until due; `TIMER_INFINITY` for an inert timer
    pub fn remaining(&self, id: TimerId) -> Result<Tick> {
        let slot = self.slot(id)?;
        Ok(self.remaining_of(slot))
    }

    fn remaining_of(&self, slot: &Timer<C>) -> Tick {
        if slot.period == TIMER_INFINITY {
            return TIMER_INFINITY;
        }
        slot.period.saturating_sub(self.ticks.elapsed(slot.last))
    }

    /// Delay until the soonest live timer is due, or the idle delay
    pub fn next_wakeup(&self) -> Tick {
        self.used
            .iter()
            .map(|i| self.remaining_of(&self.slots[i]))
            .filter(|&r| r != TIMER_INFINITY)
            .min()
            .unwrap_or(self.idle_delay)
    }

    /// Share of the last measurement window spent inside the handler
    pub fn busy_percentage(&self) -> u8 {
        100 - self.meter.idle_percent
    }

    pub fn idle_percentage(&self) -> u8 {
        self.meter.idle_percent
    }

    fn check_tick_alive(&mut self) {
        if self.ticks.count() != 0 || self.ticks.wraps() != 0 {
            self.stuck_calls = 0;
            return;
        }
        self.stuck_calls += 1;
        if self.stuck_calls > self.stuck_limit {
            fatal(Fatal::TickStuck);
        }
    }

    fn measure(&mut self, started: Tick) {
        let now = self.ticks.count();
        let m = &mut self.meter;
        m.busy = m.busy.saturating_add(now.wrapping_sub(started));
        let span = now.wrapping_sub(m.window_start);
        if span >= m.window {
            let busy = (m.busy as u64 * 100 / span as u64).min(100) as u8;
            m.idle_percent = 100 - busy;
            m.busy = 0;
            m.window_start = now;
        }
    }
}

/// Fire `idx` if it is due. Returns whether it fired.
fn fire_if_due<C: TimerContext>(ctx: &mut C, idx: usize) -> bool {
    let pool = ctx.timers();
    let now = pool.ticks.count();
    let slot = &mut pool.slots[idx];
    if slot.period == TIMER_INFINITY || now.wrapping_sub(slot.last) < slot.period {
        return false;
    }
    slot.last = now;
    let last_shot = match &mut slot.repeat {
        Repeat::Forever => false,
        Repeat::Times(n) => {
            *n -= 1;
            *n == 0
        }
    };
    let callback = slot.callback;
    let user_data = slot.user_data;
    let id = TimerId(idx as u8);
    pool.fired.set(idx);
    if last_shot {
        // Released before the callback so it can re-arm into the same slot
        let _ = pool.release(id);
    }
    trace!("timer {} fired at {}", idx, now);
    if let Some(cb) = callback {
        cb(ctx, id, user_data);
    }
    true
}

/// Run one timer pass and return the next wakeup delay.
///
/// Due timers fire lowest slot first. If a callback creates or destroys
/// a timer, scanning restarts from a fresh snapshot of the live set;
/// a timer fires at most once per pass either way.
pub fn handler<C: TimerContext>(ctx: &mut C) -> Tick {
    let pool = ctx.timers();
    pool.check_tick_alive();
    let started = pool.ticks.count();
    pool.fired.clear_all();

    'rescan: loop {
        let pool = ctx.timers();
        pool.changed = false;
        let mut snapshot = pool.used;
        for i in pool.fired.iter() {
            snapshot.clear(i);
        }
        while let Some(idx) = snapshot.first_set() {
            snapshot.clear(idx);
            if fire_if_due(ctx, idx) && ctx.timers().changed {
                continue 'rescan;
            }
        }
        break;
    }

    let pool = ctx.timers();
    pool.measure(started);
    pool.next_wakeup()
}
