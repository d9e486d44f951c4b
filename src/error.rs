//! Errors — typed failures and the fatal halt path
//!
//! Recoverable conditions come back as [`Error`]. Broken host integration
//! (frozen tick, runaway nesting, corrupted queue) goes through [`fatal`],
//! which logs the location and panics; the host's panic handler decides
//! whether that halts, resets or breaks into a debugger.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use crate::event::EventId;

/// Which fixed pool ran out of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Task,
    Timer,
    Subscriber,
    /// Per-subscriber event id list
    EventList,
    EventId,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pool::Task => "task",
            Pool::Timer => "timer",
            Pool::Subscriber => "subscriber",
            Pool::EventList => "event list",
            Pool::EventId => "event id",
        };
        f.write_str(name)
    }
}

/// Recoverable runtime error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("{0} pool exhausted")]
    Exhausted(Pool),
    #[error("not found")]
    NotFound,
    #[error("resource already held")]
    AlreadyHeld,
    #[error("task is executing")]
    Busy,
    #[error("no subscriber for event {0}")]
    NoSubscriber(EventId),
    #[error("event queue full")]
    QueueFull,
    #[error("wait timed out")]
    Timeout,
    #[error("wait cancelled")]
    Cancelled,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Unrecoverable integration fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    #[error("tick counter never advanced; is tick_inc() called?")]
    TickStuck,
    #[error("task nesting depth exceeded")]
    NestTooDeep,
    #[error("scheduler could not obtain an internal slot")]
    PoolExhausted,
    #[error("event queue holds a partial record")]
    CorruptQueue,
    #[error("wakeup delivered to a task that does not own it")]
    StaleOwner,
    #[error("scheduler timer was released")]
    LostSchedulerTimer,
}

/// Log and halt.
#[cold]
#[track_caller]
pub fn fatal(reason: Fatal) -> ! {
    let at = core::panic::Location::caller();
    log::error!("fatal: {} ({}:{})", reason, at.file(), at.line());
    panic!("fatal: {}", reason)
}
