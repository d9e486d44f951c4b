//! Task definition — stackless task records
//!
//! A task body is a plain function re-entered from the top on every
//! resumption. It reads its resume point, jumps to the matching step,
//! and returns a [`TaskState`] at the next suspension:
//!
//! ```ignore
//! fn blink(k: &mut Kernel<Led>, me: TaskId) -> TaskState {
//!     loop {
//!         match k.resume_point(me) {
//!             0 => {
//!                 k.app.toggle();
//!                 suspend!(k.delay(me, 500, 0));
//!             }
//!             _ => return k.finish(me),
//!         }
//!     }
//! }
//! ```
//!
//! Every helper stores the resume point before it returns, so a helper
//! that declines to suspend (`ControlFlow::Continue`) simply loops the
//! body into the next step.
//!
//! Author: Moroya Sakamoto

use crate::bus::SubscriberId;
use crate::error::Error;
use crate::kernel::Kernel;
use crate::timer::TimerId;

/// Resume point of a task body; 0 is the start
pub type ResumePoint = u16;

/// Resume point of a fresh or restarted task
pub const START: ResumePoint = 0;

/// Task body, invoked with the kernel and its own handle
pub type TaskFn<A> = fn(&mut Kernel<A>, TaskId) -> TaskState;

/// Task slot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u8);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn from_index(idx: usize) -> Self {
        Self(idx as u8)
    }
}

/// What a task body reports when it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Body ran to completion; the slot is released
    Terminated,
    /// Run again on the next scheduler pass
    Ready,
    /// Waiting for a timer, an event or an explicit resume
    Blocked,
}

/// Why a blocked task was made ready again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Nothing has woken the task since it last waited
    None,
    /// Delay expired
    Elapsed,
    /// Awaited event arrived, carrying its argument
    Event(usize),
    /// Event wait ran out of time
    TimedOut,
    /// Woken by `resume_task`
    Resumed,
    /// The wait could not be set up
    Failed(Error),
}

/// Static task record: no heap, no stack
pub(crate) struct Task<A> {
    pub user_data: usize,
    pub func: Option<TaskFn<A>>,
    pub lc: ResumePoint,
    pub timer: Option<TimerId>,
    pub subscriber: Option<SubscriberId>,
    pub parent: Option<TaskId>,
    pub child: Option<TaskId>,
    pub state: TaskState,
    pub wake: Wake,
    /// Body is on the call stack right now
    pub active: bool,
    /// Woken while active; a `Blocked` return becomes `Ready`
    pub rewake: bool,
}

impl<A> Task<A> {
    pub const fn empty() -> Self {
        Self {
            user_data: 0,
            func: None,
            lc: START,
            timer: None,
            subscriber: None,
            parent: None,
            child: None,
            state: TaskState::Terminated,
            wake: Wake::None,
            active: false,
            rewake: false,
        }
    }

    pub const fn new(func: TaskFn<A>, user_data: usize, parent: Option<TaskId>) -> Self {
        Self {
            user_data,
            func: Some(func),
            parent,
            state: TaskState::Ready,
            ..Self::empty()
        }
    }
}

impl<A> Clone for Task<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Task<A> {}

/// Return from the task body if a helper asks to suspend.
///
/// Helpers return `ControlFlow<TaskState>`; `Break(state)` is handed back
/// to the scheduler, `Continue` falls through.
#[macro_export]
macro_rules! suspend {
    ($helper:expr) => {
        if let ::core::ops::ControlFlow::Break(state) = $helper {
            return state;
        }
    };
}
