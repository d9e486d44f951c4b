//! Event ids and the unique id allocator
//!
//! Applications may pick fixed ids for their events, or ask the
//! allocator for ids that are guaranteed not to collide. Allocated ids
//! start at `EVENT_ID_OFFSET` so they stay clear of hand-picked ones.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use log::debug;

use crate::bitmap::{words_for, Bitmap};
use crate::config::{EVENT_ID_NUM_MAX, EVENT_ID_OFFSET};
use crate::error::{Error, Pool, Result};

const EVENT_ID_WORDS: usize = words_for(EVENT_ID_NUM_MAX);

/// Event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u16);

impl EventId {
    /// "No event"; rejected by every bus operation
    pub const INVALID: EventId = EventId(u16::MAX);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u16::MAX
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator of unique event ids
pub struct EventIdPool {
    used: Bitmap<EVENT_ID_WORDS>,
}

impl EventIdPool {
    pub const fn new() -> Self {
        Self {
            used: Bitmap::new(EVENT_ID_NUM_MAX),
        }
    }

    pub fn acquire(&mut self) -> Result<EventId> {
        let idx = self.used.acquire().ok_or(Error::Exhausted(Pool::EventId))?;
        let id = EventId(EVENT_ID_OFFSET + idx as u16);
        debug!("event id {} allocated", id);
        Ok(id)
    }

    pub fn release(&mut self, id: EventId) -> Result<()> {
        let idx = Self::index_of(id).ok_or(Error::InvalidArg)?;
        if !self.used.release(idx) {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Whether `id` is currently handed out by this pool
    pub fn is_allocated(&self, id: EventId) -> bool {
        Self::index_of(id).is_some_and(|i| self.used.get(i))
    }

    pub fn count(&self) -> usize {
        self.used.count()
    }

    fn index_of(id: EventId) -> Option<usize> {
        let idx = id.0.checked_sub(EVENT_ID_OFFSET)? as usize;
        (idx < EVENT_ID_NUM_MAX).then_some(idx)
    }
}

impl Default for EventIdPool {
    fn default() -> Self {
        Self::new()
    }
}
