//! Stackless RTOS — cooperative tasks without per-task stacks
//!
//! Don't give every task a stack, give it a resume point.
//!
//! Allocation-free runtime for microcontroller-class targets:
//! - Bit-scan slot pools (no heap, no allocation)
//! - Software timers driven by a host tick, with next-wakeup computation
//! - Publish/subscribe event bus with queued and synchronous delivery
//! - Stackless tasks: yield, block, delay, wait-for-event, subtask await
//!
//! Author: Moroya Sakamoto

#![no_std]

pub mod config;
pub mod error;
pub mod bitmap;
pub mod tick;
pub mod deque;
pub mod timer;
pub mod event;
pub mod bus;
pub mod task;
pub mod scheduler;
pub mod kernel;

pub use bitmap::Bitmap;
pub use bus::{BusContext, Delivery, EventBus, SubscriberCallback, SubscriberId};
pub use config::RuntimeConfig;
pub use deque::ByteDeque;
pub use error::{Error, Fatal, Pool, Result};
pub use event::{EventId, EventIdPool};
pub use kernel::{Kernel, KernelStats};
pub use scheduler::Scheduler;
pub use task::{ResumePoint, TaskFn, TaskId, TaskState, Wake, START};
pub use tick::{Tick, TickCounter};
pub use timer::{Repeat, TimerCallback, TimerContext, TimerId, TimerPool, TIMER_INFINITY};
