//! Event bus — publish/subscribe with queued and synchronous delivery
//!
//! Subscribers live in a fixed pool and are chained in registration
//! order through index links. Each subscriber listens to a short list of
//! event ids. Queued events are `(id, arg)` records in a byte deque and
//! are delivered by [`dispatch`]; [`publish_immediate`] delivers inline.
//!
//! A callback may unsubscribe its own subscriber while it runs. Removing
//! *other* subscribers from inside a callback is not supported: it stays
//! memory safe, but which of them still receive the current event is
//! unspecified.
//!
//! Author: Moroya Sakamoto

use core::mem::size_of;

use heapless::Vec;
use log::{debug, trace, warn};

use crate::bitmap::{words_for, Bitmap};
use crate::config::{EVENT_QUEUE_NUM_MAX, SUBSCRIBER_NUM_MAX, SUBSCR_ID_LIST_NUM_MAX};
use crate::deque::ByteDeque;
use crate::error::{fatal, Error, Fatal, Pool, Result};
use crate::event::EventId;

/// Encoded size of one queued event: id (u16 LE) + arg (usize LE)
pub const MSG_SIZE: usize = size_of::<u16>() + size_of::<usize>();

const QUEUE_BYTES: usize = EVENT_QUEUE_NUM_MAX * MSG_SIZE;
const SUBSCRIBER_WORDS: usize = words_for(SUBSCRIBER_NUM_MAX);

/// Subscriber slot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u8);

impl SubscriberId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One delivery of an event to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub subscriber: SubscriberId,
    pub event: EventId,
    /// Subscribers still to be served for this message after this one
    pub remaining: usize,
    pub arg: usize,
    pub user_data: usize,
}

pub type SubscriberCallback<C> = fn(&mut C, Delivery);

struct Subscriber<C> {
    events: Vec<EventId, SUBSCR_ID_LIST_NUM_MAX>,
    prev: Option<SubscriberId>,
    next: Option<SubscriberId>,
    callback: Option<SubscriberCallback<C>>,
    user_data: usize,
}

impl<C> Subscriber<C> {
    const fn empty() -> Self {
        Self {
            events: Vec::new(),
            prev: None,
            next: None,
            callback: None,
            user_data: 0,
        }
    }
}

/// Callback identity by code address.
///
/// Identical function bodies may be merged into one address, and one
/// function may end up with several, so two callbacks with the same
/// body can compare equal.
fn same_callback<C>(a: SubscriberCallback<C>, b: SubscriberCallback<C>) -> bool {
    core::ptr::fn_addr_eq(a, b)
}

/// Something that owns an event bus for callbacks of its own type
pub trait BusContext: Sized {
    fn bus(&mut self) -> &mut EventBus<Self>;
}

/// Subscriber pool plus pending event queue
pub struct EventBus<C> {
    slots: [Subscriber<C>; SUBSCRIBER_NUM_MAX],
    used: Bitmap<SUBSCRIBER_WORDS>,
    head: Option<SubscriberId>,
    tail: Option<SubscriberId>,
    queue: ByteDeque<QUEUE_BYTES>,
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Subscriber::empty()),
            used: Bitmap::new(SUBSCRIBER_NUM_MAX),
            head: None,
            tail: None,
            queue: ByteDeque::new(),
        }
    }

    /// Register a subscriber with no events yet, at the end of the list
    pub fn create_subscriber(&mut self, callback: SubscriberCallback<C>, user_data: usize) -> Result<SubscriberId> {
        let idx = self.used.acquire().ok_or(Error::Exhausted(Pool::Subscriber))?;
        let id = SubscriberId(idx as u8);
        self.slots[idx] = Subscriber {
            callback: Some(callback),
            user_data,
            prev: self.tail,
            ..Subscriber::empty()
        };
        match self.tail {
            Some(t) => self.slots[t.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        debug!("subscriber {} created", idx);
        Ok(id)
    }

    /// Remove a subscriber and every event it listens to
    pub fn unsubscribe_by_handle(&mut self, id: SubscriberId) -> Result<()> {
        if !self.used.get(id.index()) {
            return Err(Error::NotFound);
        }
        let Subscriber { prev, next, .. } = self.slots[id.index()];
        match prev {
            Some(p) => self.slots[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n.index()].prev = prev,
            None => self.tail = prev,
        }
        self.slots[id.index()] = Subscriber::empty();
        self.used.release(id.index());
        debug!("subscriber {} released", id.index());
        Ok(())
    }

    /// Add `event` to a subscriber's list; a no-op if it is already there
    pub fn subscribe_to(&mut self, id: SubscriberId, event: EventId) -> Result<()> {
        if !event.is_valid() {
            return Err(Error::InvalidArg);
        }
        let sub = self.live_mut(id)?;
        if sub.events.contains(&event) {
            return Ok(());
        }
        sub.events
            .push(event)
            .map_err(|_| Error::Exhausted(Pool::EventList))
    }

    /// Drop `event` from a subscriber's list; the subscriber stays registered
    pub fn unsubscribe_from(&mut self, id: SubscriberId, event: EventId) -> Result<()> {
        let sub = self.live_mut(id)?;
        let before = sub.events.len();
        sub.events.retain(|&e| e != event);
        if sub.events.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Subscribe `callback` to `event`
    ///
    /// Idempotent: the same callback, user data and event return the
    /// existing registration. Callbacks are told apart by address, so
    /// distinct functions with identical bodies may be treated as one;
    /// give them different user data to keep them apart.
    pub fn subscribe(&mut self, event: EventId, callback: SubscriberCallback<C>, user_data: usize) -> Result<SubscriberId> {
        if !event.is_valid() {
            return Err(Error::InvalidArg);
        }
        let existing = self.iter().find(|&id| {
            let sub = &self.slots[id.index()];
            sub.user_data == user_data
                && sub.events.contains(&event)
                && sub.callback.is_some_and(|cb| same_callback(cb, callback))
        });
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = self.create_subscriber(callback, user_data)?;
        if let Err(e) = self.subscribe_to(id, event) {
            let _ = self.unsubscribe_by_handle(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove `event` from every subscriber using `callback`
    ///
    /// Subscribers left with no events are released. `callback` is
    /// matched by address, as in [`EventBus::subscribe`].
    pub fn unsubscribe(&mut self, event: EventId, callback: SubscriberCallback<C>) -> Result<()> {
        self.remove_where(|sub| sub.callback.is_some_and(|cb| same_callback(cb, callback)), Some(event))
    }

    /// Release every subscriber using `callback`
    pub fn unsubscribe_callback(&mut self, callback: SubscriberCallback<C>) -> Result<()> {
        self.remove_where(|sub| sub.callback.is_some_and(|cb| same_callback(cb, callback)), None)
    }

    /// Remove `event` from every subscriber
    pub fn unsubscribe_event(&mut self, event: EventId) -> Result<()> {
        self.remove_where(|_| true, Some(event))
    }

    fn remove_where(&mut self, matches: impl Fn(&Subscriber<C>) -> bool, event: Option<EventId>) -> Result<()> {
        let mut found = false;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let sub = &mut self.slots[id.index()];
            cursor = sub.next;
            if !matches(sub) {
                continue;
            }
            match event {
                Some(e) => {
                    let before = sub.events.len();
                    sub.events.retain(|&x| x != e);
                    if sub.events.len() == before {
                        continue;
                    }
                    found = true;
                    if sub.events.is_empty() {
                        self.unsubscribe_by_handle(id)?;
                    }
                }
                None => {
                    found = true;
                    self.unsubscribe_by_handle(id)?;
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Subscribers currently listening to `event`
    pub fn ref_count(&self, event: EventId) -> usize {
        self.iter()
            .filter(|id| self.slots[id.index()].events.contains(&event))
            .count()
    }

    /// Queue `event` for the next [`dispatch`]
    pub fn publish(&mut self, event: EventId, arg: usize) -> Result<()> {
        if !event.is_valid() {
            return Err(Error::InvalidArg);
        }
        if self.ref_count(event) == 0 {
            warn!("no one subscribed to event {}", event);
            return Err(Error::NoSubscriber(event));
        }
        if self.queue.push_back(&encode(event, arg)) != MSG_SIZE {
            warn!("event queue full, event {} dropped", event);
            return Err(Error::QueueFull);
        }
        trace!("event {} queued", event);
        Ok(())
    }

    /// Events waiting for dispatch
    pub fn pending(&self) -> usize {
        self.queue.filled() / MSG_SIZE
    }

    pub fn is_live(&self, id: SubscriberId) -> bool {
        self.used.get(id.index())
    }

    /// Live subscriber count
    pub fn count(&self) -> usize {
        self.used.count()
    }

    /// Event ids `id` listens to
    pub fn events(&self, id: SubscriberId) -> Result<&[EventId]> {
        if !self.is_live(id) {
            return Err(Error::NotFound);
        }
        Ok(self.slots[id.index()].events.as_slice())
    }

    pub fn user_data(&self, id: SubscriberId) -> Result<usize> {
        if !self.is_live(id) {
            return Err(Error::NotFound);
        }
        Ok(self.slots[id.index()].user_data)
    }

    /// Live subscribers in registration order
    pub fn iter(&self) -> impl Iterator<Item = SubscriberId> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.slots[id.index()].next;
            Some(id)
        })
    }

    fn live_mut(&mut self, id: SubscriberId) -> Result<&mut Subscriber<C>> {
        if !self.used.get(id.index()) {
            return Err(Error::NotFound);
        }
        Ok(&mut self.slots[id.index()])
    }
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(event: EventId, arg: usize) -> [u8; MSG_SIZE] {
    let mut raw = [0u8; MSG_SIZE];
    raw[..2].copy_from_slice(&event.0.to_le_bytes());
    raw[2..].copy_from_slice(&arg.to_le_bytes());
    raw
}

fn decode(raw: &[u8; MSG_SIZE]) -> (EventId, usize) {
    let mut id = [0u8; 2];
    id.copy_from_slice(&raw[..2]);
    let mut arg = [0u8; size_of::<usize>()];
    arg.copy_from_slice(&raw[2..]);
    (EventId(u16::from_le_bytes(id)), usize::from_le_bytes(arg))
}

/// Hand one event to every subscriber of it, in registration order.
///
/// The subscriber count taken up front is the delivery budget, so a
/// subscriber registered by one of these callbacks is not served.
fn deliver<C: BusContext>(ctx: &mut C, event: EventId, arg: usize) -> usize {
    let bus = ctx.bus();
    let mut remaining = bus.ref_count(event);
    let mut cursor = bus.head;
    let mut delivered = 0;
    while remaining > 0 {
        let Some(id) = cursor else { break };
        let sub = &ctx.bus().slots[id.index()];
        // taken before the callback: it may release `id`
        cursor = sub.next;
        let Some(callback) = sub.callback else { continue };
        if !sub.events.contains(&event) {
            continue;
        }
        remaining -= 1;
        let user_data = sub.user_data;
        callback(
            ctx,
            Delivery {
                subscriber: id,
                event,
                remaining,
                arg,
                user_data,
            },
        );
        delivered += 1;
    }
    delivered
}

/// Deliver `event` inline, bypassing the queue.
///
/// Returns the number of callbacks invoked.
pub fn publish_immediate<C: BusContext>(ctx: &mut C, event: EventId, arg: usize) -> Result<usize> {
    if !event.is_valid() {
        return Err(Error::InvalidArg);
    }
    if ctx.bus().ref_count(event) == 0 {
        warn!("no one subscribed to event {}", event);
        return Err(Error::NoSubscriber(event));
    }
    Ok(deliver(ctx, event, arg))
}

/// Deliver every event queued before this call.
///
/// Events published by the callbacks stay queued for the next dispatch.
/// Returns the number of callbacks invoked.
pub fn dispatch<C: BusContext>(ctx: &mut C) -> usize {
    let filled = ctx.bus().queue.filled();
    if filled % MSG_SIZE != 0 {
        fatal(Fatal::CorruptQueue);
    }
    let mut delivered = 0;
    for _ in 0..filled / MSG_SIZE {
        let mut raw = [0u8; MSG_SIZE];
        match ctx.bus().queue.pop_front(&mut raw) {
            0 => break,
            MSG_SIZE => {}
            _ => fatal(Fatal::CorruptQueue),
        }
        let (event, arg) = decode(&raw);
        trace!("dispatching event {}", event);
        delivered += deliver(ctx, event, arg);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVT: EventId = EventId(7);
    const OTHER: EventId = EventId(8);

    struct Host {
        bus: EventBus<Host>,
        log: Vec<(usize, usize, usize), 32>,
    }

    impl BusContext for Host {
        fn bus(&mut self) -> &mut EventBus<Self> {
            &mut self.bus
        }
    }

    impl Host {
        fn new() -> Self {
            Self {
                bus: EventBus::new(),
                log: Vec::new(),
            }
        }
    }

    fn record(h: &mut Host, d: Delivery) {
        h.log.push((d.user_data, d.remaining, d.arg)).unwrap();
    }

    fn record_and_leave(h: &mut Host, d: Delivery) {
        record(h, d);
        h.bus.unsubscribe_by_handle(d.subscriber).unwrap();
    }

    fn record_and_join(h: &mut Host, d: Delivery) {
        record(h, d);
        let _ = h.bus.subscribe(d.event, record, 100 + d.user_data);
    }

    fn republish(h: &mut Host, d: Delivery) {
        record(h, d);
        h.bus.publish(d.event, d.arg + 1).unwrap();
    }

    #[test]
    fn test_delivery_order_and_ref_count() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record, 1).unwrap();
        h.bus.subscribe(OTHER, record, 2).unwrap();
        h.bus.subscribe(EVT, record, 3).unwrap();
        h.bus.subscribe(EVT, record, 4).unwrap();
        assert_eq!(h.bus.ref_count(EVT), 3);

        h.bus.publish(EVT, 42).unwrap();
        assert_eq!(h.bus.pending(), 1);
        assert_eq!(dispatch(&mut h), 3);
        assert_eq!(h.log.as_slice(), &[(1, 2, 42), (3, 1, 42), (4, 0, 42)]);
        assert_eq!(h.bus.pending(), 0);
    }

    #[test]
    fn test_fifo_across_messages() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record, 1).unwrap();
        h.bus.subscribe(OTHER, record, 2).unwrap();
        h.bus.publish(OTHER, 1).unwrap();
        h.bus.publish(EVT, 2).unwrap();
        h.bus.publish(OTHER, 3).unwrap();
        dispatch(&mut h);
        assert_eq!(h.log.as_slice(), &[(2, 0, 1), (1, 0, 2), (2, 0, 3)]);
    }

    #[test]
    fn test_no_subscriber_never_queued() {
        let mut h = Host::new();
        assert_eq!(h.bus.publish(EVT, 0), Err(Error::NoSubscriber(EVT)));
        assert_eq!(h.bus.pending(), 0);
        assert_eq!(publish_immediate(&mut h, EVT, 0), Err(Error::NoSubscriber(EVT)));
        assert_eq!(h.bus.publish(EventId::INVALID, 0), Err(Error::InvalidArg));
    }

    #[test]
    fn test_queue_full() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record, 1).unwrap();
        for i in 0..EVENT_QUEUE_NUM_MAX {
            h.bus.publish(EVT, i).unwrap();
        }
        assert_eq!(h.bus.publish(EVT, 99), Err(Error::QueueFull));
        assert_eq!(dispatch(&mut h), EVENT_QUEUE_NUM_MAX);
    }

    #[test]
    fn test_publish_immediate() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record, 1).unwrap();
        h.bus.subscribe(EVT, record, 2).unwrap();
        assert_eq!(publish_immediate(&mut h, EVT, 5), Ok(2));
        assert_eq!(h.log.as_slice(), &[(1, 1, 5), (2, 0, 5)]);
        assert_eq!(h.bus.pending(), 0);
    }

    #[test]
    fn test_self_unsubscribe_during_dispatch() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record, 1).unwrap();
        h.bus.subscribe(EVT, record_and_leave, 2).unwrap();
        h.bus.subscribe(EVT, record, 3).unwrap();
        h.bus.publish(EVT, 0).unwrap();
        h.bus.publish(EVT, 0).unwrap();
        dispatch(&mut h);
        assert_eq!(
            h.log.as_slice(),
            &[(1, 2, 0), (2, 1, 0), (3, 0, 0), (1, 1, 0), (3, 0, 0)]
        );
        assert_eq!(h.bus.count(), 2);
    }

    #[test]
    fn test_newcomer_not_served_mid_dispatch() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, record_and_join, 1).unwrap();
        h.bus.publish(EVT, 0).unwrap();
        assert_eq!(dispatch(&mut h), 1);
        assert_eq!(h.bus.ref_count(EVT), 2);
    }

    #[test]
    fn test_republished_events_wait_for_next_dispatch() {
        let mut h = Host::new();
        h.bus.subscribe(EVT, republish, 1).unwrap();
        h.bus.publish(EVT, 0).unwrap();
        assert_eq!(dispatch(&mut h), 1);
        assert_eq!(h.bus.pending(), 1);
        assert_eq!(dispatch(&mut h), 1);
        assert_eq!(h.log[1], (1, 0, 1));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut h = Host::new();
        let a = h.bus.subscribe(EVT, record, 1).unwrap();
        let b = h.bus.subscribe(EVT, record, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(h.bus.count(), 1);
        // different user data is a different registration
        let c = h.bus.subscribe(EVT, record, 2).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_callbacks_told_apart() {
        let mut h = Host::new();
        let a = h.bus.subscribe(EVT, record, 1).unwrap();
        let b = h.bus.subscribe(EVT, republish, 1).unwrap();
        assert_ne!(a, b);

        h.bus.unsubscribe(EVT, republish).unwrap();
        assert!(h.bus.is_live(a));
        assert!(!h.bus.is_live(b));
        assert_eq!(h.bus.unsubscribe_callback(republish), Err(Error::NotFound));
    }

    #[test]
    fn test_event_list_limit() {
        let mut h = Host::new();
        let id = h.bus.create_subscriber(record, 0).unwrap();
        h.bus.subscribe_to(id, EVT).unwrap();
        h.bus.subscribe_to(id, EVT).unwrap();
        h.bus.subscribe_to(id, OTHER).unwrap();
        assert_eq!(h.bus.events(id).unwrap(), &[EVT, OTHER]);
        assert_eq!(h.bus.subscribe_to(id, EventId(9)), Err(Error::Exhausted(Pool::EventList)));
        assert_eq!(h.bus.subscribe_to(id, EventId::INVALID), Err(Error::InvalidArg));

        h.bus.unsubscribe_from(id, EVT).unwrap();
        assert_eq!(h.bus.unsubscribe_from(id, EVT), Err(Error::NotFound));
        assert_eq!(h.bus.events(id).unwrap(), &[OTHER]);
    }

    #[test]
    fn test_unsubscribe_variants() {
        let mut h = Host::new();
        let a = h.bus.create_subscriber(record, 1).unwrap();
        h.bus.subscribe_to(a, EVT).unwrap();
        h.bus.subscribe_to(a, OTHER).unwrap();
        let b = h.bus.subscribe(EVT, record_and_leave, 2).unwrap();

        // pair removal keeps `a` alive for OTHER, releases nothing else
        h.bus.unsubscribe(EVT, record).unwrap();
        assert_eq!(h.bus.events(a).unwrap(), &[OTHER]);
        assert!(h.bus.is_live(b));
        assert_eq!(h.bus.unsubscribe(EVT, record), Err(Error::NotFound));

        h.bus.unsubscribe_event(EVT).unwrap();
        assert!(!h.bus.is_live(b));

        h.bus.unsubscribe_callback(record).unwrap();
        assert_eq!(h.bus.count(), 0);
        assert_eq!(h.bus.unsubscribe_by_handle(a), Err(Error::NotFound));
    }

    #[test]
    fn test_registration_order_survives_release() {
        let mut h = Host::new();
        let a = h.bus.subscribe(EVT, record, 1).unwrap();
        h.bus.subscribe(EVT, record, 2).unwrap();
        h.bus.unsubscribe_by_handle(a).unwrap();
        // reuses slot 0 but joins at the tail
        h.bus.subscribe(EVT, record, 3).unwrap();
        publish_immediate(&mut h, EVT, 0).unwrap();
        assert_eq!(h.log.as_slice(), &[(2, 1, 0), (3, 0, 0)]);
    }

    #[test]
    fn test_subscriber_exhaustion() {
        let mut h = Host::new();
        for i in 0..SUBSCRIBER_NUM_MAX {
            h.bus.subscribe(EVT, record, i).unwrap();
        }
        assert_eq!(h.bus.subscribe(EVT, record, 99), Err(Error::Exhausted(Pool::Subscriber)));
    }

    #[test]
    #[should_panic(expected = "partial record")]
    fn test_corrupt_queue_is_fatal() {
        let mut h = Host::new();
        h.bus.queue.push_back(&[1, 2, 3]);
        dispatch(&mut h);
    }
}
