//! Cooperative scheduler — stackless tasks over timers and events
//!
//! Tasks never preempt each other. A task runs until it returns, and the
//! only ways back into it are:
//! - the scheduler pass, driven by an internal timer, which invokes every
//!   READY top-level task once;
//! - a timer or event wakeup for that task, which marks its ancestor chain
//!   READY and invokes the root synchronously from inside the callback.
//!
//! A parent awaiting a subtask forwards every invocation to the child
//! until the child terminates, then continues at its own next step.
//!
//! Author: Moroya Sakamoto

use core::ops::ControlFlow;

use log::{debug, trace, warn};

use crate::bitmap::{words_for, Bitmap};
use crate::bus::{Delivery, SubscriberCallback, SubscriberId};
use crate::config::{RuntimeConfig, SUBSCR_ID_LIST_NUM_MAX, TASK_NUM_MAX};
use crate::error::{fatal, Error, Fatal, Pool, Result};
use crate::event::EventId;
use crate::kernel::Kernel;
use crate::task::{ResumePoint, Task, TaskFn, TaskId, TaskState, Wake, START};
use crate::tick::Tick;
use crate::timer::{TimerCallback, TimerId, TIMER_INFINITY};

const TASK_WORDS: usize = words_for(TASK_NUM_MAX);

/// Task table and scheduling state
///
/// Static table, no dynamic allocation.
pub struct Scheduler<A> {
    /// Static task table
    tasks: [Task<A>; TASK_NUM_MAX],
    used: Bitmap<TASK_WORDS>,
    /// Task bodies currently on the call stack
    depth: u8,
    depth_max: u8,
    /// Internal timer that triggers a pass
    timer: TimerId,
    in_pass: bool,
    /// Completed scheduler passes
    passes: u32,
}

impl<A> Scheduler<A> {
    pub(crate) fn new(timer: TimerId, config: &RuntimeConfig) -> Self {
        Self {
            tasks: [Task::empty(); TASK_NUM_MAX],
            used: Bitmap::new(TASK_NUM_MAX),
            depth: 0,
            depth_max: config.nest_depth_max,
            timer,
            in_pass: false,
            passes: 0,
        }
    }

    /// Live task count
    pub fn task_count(&self) -> usize {
        self.used.count()
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Current nesting depth of task invocations
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn timer(&self) -> TimerId {
        self.timer
    }

    fn live(&self, id: TaskId) -> Option<&Task<A>> {
        self.used.get(id.index()).then(|| &self.tasks[id.index()])
    }

    fn any_ready_root(&self) -> bool {
        self.used.iter().any(|i| {
            let t = &self.tasks[i];
            t.parent.is_none() && t.state == TaskState::Ready && !t.active
        })
    }
}

impl<A> Kernel<A> {
    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Create a top-level task; it first runs on the next pass
    pub fn create_task(&mut self, func: TaskFn<A>, user_data: usize) -> Result<TaskId> {
        let id = self.alloc_task(func, user_data, None)?;
        self.request_pass(0);
        Ok(id)
    }

    /// Create a top-level task and run it right away
    pub fn start_task(&mut self, func: TaskFn<A>, user_data: usize) -> Result<TaskId> {
        let id = self.alloc_task(func, user_data, None)?;
        if self.invoke(id) == TaskState::Ready {
            self.request_pass(1);
        }
        Ok(id)
    }

    /// Create a subtask of `parent`
    ///
    /// The subtask is never scheduled on its own: it runs only when the
    /// parent is invoked. Usually reached through [`Kernel::await_subtask`].
    pub fn create_subtask(&mut self, parent: TaskId, func: TaskFn<A>, user_data: usize) -> Result<TaskId> {
        let p = self.scheduler.live(parent).ok_or(Error::InvalidArg)?;
        if p.child.is_some() {
            return Err(Error::AlreadyHeld);
        }
        let id = self.alloc_task(func, user_data, Some(parent))?;
        self.scheduler.tasks[parent.index()].child = Some(id);
        Ok(id)
    }

    fn alloc_task(&mut self, func: TaskFn<A>, user_data: usize, parent: Option<TaskId>) -> Result<TaskId> {
        let idx = self.scheduler.used.acquire().ok_or(Error::Exhausted(Pool::Task))?;
        self.scheduler.tasks[idx] = Task::new(func, user_data, parent);
        debug!("task {} created", idx);
        Ok(TaskId::from_index(idx))
    }

    /// Tear down a task that is not running
    ///
    /// Pending waits and the whole subtask chain are released with it.
    /// A parent awaiting the destroyed task continues past its await.
    pub fn destroy_task(&mut self, id: TaskId) -> Result<()> {
        let task = self.scheduler.live(id).ok_or(Error::NotFound)?;
        if task.active {
            return Err(Error::Busy);
        }
        self.reap(id);
        Ok(())
    }

    fn reap(&mut self, id: TaskId) {
        if let Some(p) = self.scheduler.tasks[id.index()].parent {
            let parent = &mut self.scheduler.tasks[p.index()];
            if parent.child == Some(id) {
                parent.child = None;
                // an idle parent would otherwise wait on a child that is gone
                if !parent.active {
                    self.mark_chain_ready(p);
                    self.request_pass(0);
                }
            }
        }
        let mut cursor = Some(id);
        while let Some(t) = cursor {
            self.cancel_wait(t);
            cursor = self.scheduler.tasks[t.index()].child;
            self.scheduler.tasks[t.index()] = Task::empty();
            self.scheduler.used.release(t.index());
            debug!("task {} released", t.index());
        }
    }

    /// Make a task runnable on the next pass, cancelling any wait
    pub fn resume_task(&mut self, id: TaskId) -> Result<()> {
        self.scheduler.live(id).ok_or(Error::NotFound)?;
        self.cancel_wait(id);
        self.scheduler.tasks[id.index()].wake = Wake::Resumed;
        self.mark_chain_ready(id);
        self.request_pass(0);
        Ok(())
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.scheduler.live(id).map(|t| t.state)
    }

    pub fn task_user_data(&self, id: TaskId) -> Option<usize> {
        self.scheduler.live(id).map(|t| t.user_data)
    }

    pub fn task_parent(&self, id: TaskId) -> Option<TaskId> {
        self.scheduler.live(id).and_then(|t| t.parent)
    }

    pub fn task_child(&self, id: TaskId) -> Option<TaskId> {
        self.scheduler.live(id).and_then(|t| t.child)
    }

    pub fn task_count(&self) -> usize {
        self.scheduler.task_count()
    }

    // ---------------------------------------------------------------
    // Task body helpers
    // ---------------------------------------------------------------

    pub fn resume_point(&self, me: TaskId) -> ResumePoint {
        self.scheduler.tasks[me.index()].lc
    }

    pub fn set_resume_point(&mut self, me: TaskId, at: ResumePoint) {
        self.scheduler.tasks[me.index()].lc = at;
    }

    /// Why the task last woke up
    pub fn wake(&self, me: TaskId) -> Wake {
        self.scheduler.tasks[me.index()].wake
    }

    /// Outcome of the last delay or wait
    ///
    /// `Ok(arg)` for an event, `Ok(0)` for an elapsed delay,
    /// `Err(Timeout)`, `Err(Cancelled)` after `resume_task`, or the error
    /// that kept the wait from starting.
    pub fn wait_result(&self, me: TaskId) -> Result<usize> {
        match self.wake(me) {
            Wake::Event(arg) => Ok(arg),
            Wake::Elapsed => Ok(0),
            Wake::TimedOut => Err(Error::Timeout),
            Wake::Resumed => Err(Error::Cancelled),
            Wake::Failed(e) => Err(e),
            Wake::None => Err(Error::NotFound),
        }
    }

    /// Give way until the next pass, then continue at `next`
    pub fn yield_now(&mut self, me: TaskId, next: ResumePoint) -> ControlFlow<TaskState> {
        self.set_resume_point(me, next);
        ControlFlow::Break(TaskState::Ready)
    }

    /// Wait for `resume_task`, then continue at `next`
    pub fn block(&mut self, me: TaskId, next: ResumePoint) -> ControlFlow<TaskState> {
        self.set_resume_point(me, next);
        self.scheduler.tasks[me.index()].wake = Wake::None;
        ControlFlow::Break(TaskState::Blocked)
    }

    /// Sleep `ticks`, then continue at `next`
    pub fn delay(&mut self, me: TaskId, ticks: Tick, next: ResumePoint) -> ControlFlow<TaskState> {
        self.set_resume_point(me, next);
        self.scheduler.tasks[me.index()].wake = Wake::None;
        match self.acquire_timer(me, ticks, wake_on_timer::<A>) {
            Ok(_) => ControlFlow::Break(TaskState::Blocked),
            Err(e) => self.wait_failed(me, e),
        }
    }

    pub fn delay_ms(&mut self, me: TaskId, ms: u32, next: ResumePoint) -> ControlFlow<TaskState> {
        let ticks = self.timers.ticks().ms_to_ticks(ms);
        self.delay(me, ticks, next)
    }

    /// Wait for `event` or `timeout` ticks, whichever comes first
    pub fn wait_until(&mut self, me: TaskId, event: EventId, timeout: Tick, next: ResumePoint) -> ControlFlow<TaskState> {
        self.wait_until_any(me, &[event], timeout, next)
    }

    /// Wait for any of `events` or `timeout` ticks
    ///
    /// A timeout of `TIMER_INFINITY` waits for the event alone.
    pub fn wait_until_any(
        &mut self,
        me: TaskId,
        events: &[EventId],
        timeout: Tick,
        next: ResumePoint,
    ) -> ControlFlow<TaskState> {
        self.set_resume_point(me, next);
        self.scheduler.tasks[me.index()].wake = Wake::None;
        match self.arm_wait(me, events, timeout) {
            Ok(()) => ControlFlow::Break(TaskState::Blocked),
            Err(e) => self.wait_failed(me, e),
        }
    }

    fn arm_wait(&mut self, me: TaskId, events: &[EventId], timeout: Tick) -> Result<()> {
        if events.is_empty() || events.len() > SUBSCR_ID_LIST_NUM_MAX || events.iter().any(|e| !e.is_valid()) {
            return Err(Error::InvalidArg);
        }
        let sub = self.acquire_subscriber(me, wake_on_event::<A>)?;
        for &event in events {
            if let Err(e) = self.bus.subscribe_to(sub, event) {
                self.cancel_wait(me);
                return Err(e);
            }
        }
        if timeout != TIMER_INFINITY {
            if let Err(e) = self.acquire_timer(me, timeout, wake_on_timer::<A>) {
                self.cancel_wait(me);
                return Err(e);
            }
        }
        Ok(())
    }

    fn wait_failed(&mut self, me: TaskId, e: Error) -> ControlFlow<TaskState> {
        warn!("task {} could not wait: {}", me.index(), e);
        self.scheduler.tasks[me.index()].wake = Wake::Failed(e);
        ControlFlow::Continue(())
    }

    /// Run `func` as a subtask until it terminates, then continue at `next`
    ///
    /// While the subtask is pending the parent reports the subtask's
    /// state, and every invocation of the parent resumes the subtask.
    pub fn await_subtask(
        &mut self,
        me: TaskId,
        func: TaskFn<A>,
        user_data: usize,
        next: ResumePoint,
    ) -> ControlFlow<TaskState> {
        self.set_resume_point(me, next);
        let child = match self.create_subtask(me, func, user_data) {
            Ok(child) => child,
            Err(e) => return self.wait_failed(me, e),
        };
        match self.invoke(child) {
            TaskState::Terminated => ControlFlow::Continue(()),
            state => ControlFlow::Break(state),
        }
    }

    /// Start over from the top on the next pass
    pub fn restart(&mut self, me: TaskId) -> TaskState {
        self.set_resume_point(me, START);
        TaskState::Ready
    }

    /// End the task; its slot is released when the body returns
    pub fn finish(&mut self, me: TaskId) -> TaskState {
        self.set_resume_point(me, START);
        TaskState::Terminated
    }

    // ---------------------------------------------------------------
    // Per-task wait resources
    // ---------------------------------------------------------------

    /// Give `me` a one-shot timer
    pub fn acquire_timer(&mut self, me: TaskId, period: Tick, callback: TimerCallback<Self>) -> Result<TimerId> {
        let task = self.scheduler.live(me).ok_or(Error::InvalidArg)?;
        if task.timer.is_some() {
            return Err(Error::AlreadyHeld);
        }
        let timer = self.timers.create_oneshot(period, callback, me.index())?;
        self.scheduler.tasks[me.index()].timer = Some(timer);
        Ok(timer)
    }

    pub fn release_timer(&mut self, me: TaskId) -> Result<()> {
        let timer = self.scheduler.tasks[me.index()].timer.take().ok_or(Error::NotFound)?;
        self.timers.destroy(timer)
    }

    /// Give `me` an event subscriber with an empty event list
    pub fn acquire_subscriber(&mut self, me: TaskId, callback: SubscriberCallback<Self>) -> Result<SubscriberId> {
        let task = self.scheduler.live(me).ok_or(Error::InvalidArg)?;
        if task.subscriber.is_some() {
            return Err(Error::AlreadyHeld);
        }
        let sub = self.bus.create_subscriber(callback, me.index())?;
        self.scheduler.tasks[me.index()].subscriber = Some(sub);
        Ok(sub)
    }

    pub fn release_subscriber(&mut self, me: TaskId) -> Result<()> {
        let sub = self.scheduler.tasks[me.index()].subscriber.take().ok_or(Error::NotFound)?;
        self.bus.unsubscribe_by_handle(sub)
    }

    /// Drop whatever timer and subscriber `id` still holds
    fn cancel_wait(&mut self, id: TaskId) {
        let _ = self.release_timer(id);
        let _ = self.release_subscriber(id);
    }

    // ---------------------------------------------------------------
    // Invocation
    // ---------------------------------------------------------------

    /// Run one task body (or its pending subtask) and record the result
    fn invoke(&mut self, id: TaskId) -> TaskState {
        let Some(func) = self.scheduler.live(id).and_then(|t| t.func) else {
            return TaskState::Terminated;
        };
        if self.scheduler.depth >= self.scheduler.depth_max {
            fatal(Fatal::NestTooDeep);
        }
        self.scheduler.depth += 1;
        let task = &mut self.scheduler.tasks[id.index()];
        task.active = true;
        task.rewake = false;
        trace!("task {} invoked, depth {}", id.index(), self.scheduler.depth);

        let state = match self.forward_to_child(id) {
            Some(pending) => pending,
            None => func(self, id),
        };

        self.scheduler.depth -= 1;
        let task = &mut self.scheduler.tasks[id.index()];
        task.active = false;
        let state = match state {
            TaskState::Blocked if task.rewake => TaskState::Ready,
            other => other,
        };
        task.rewake = false;
        task.state = state;
        if state == TaskState::Terminated {
            self.reap(id);
        }
        state
    }

    /// Resume the subtask `id` is awaiting; `None` once there is none left
    fn forward_to_child(&mut self, id: TaskId) -> Option<TaskState> {
        let child = self.scheduler.tasks[id.index()].child?;
        let state = match self.scheduler.tasks[child.index()].state {
            TaskState::Ready => self.invoke(child),
            pending => pending,
        };
        (state != TaskState::Terminated).then_some(state)
    }

    /// Mark `id` and its ancestors READY; returns the root and whether
    /// any of them is mid-invocation
    fn mark_chain_ready(&mut self, id: TaskId) -> (TaskId, bool) {
        let mut cursor = id;
        let mut busy = false;
        loop {
            let task = &mut self.scheduler.tasks[cursor.index()];
            task.state = TaskState::Ready;
            busy |= task.active;
            match task.parent {
                Some(p) => cursor = p,
                None => return (cursor, busy),
            }
        }
    }

    /// Resume a woken task right now through its root
    ///
    /// If the task or an ancestor is mid-invocation the wakeup is
    /// deferred to the next pass, and a `Blocked` return from the woken
    /// task still leaves it READY.
    fn wake_chain(&mut self, id: TaskId) {
        let (root, busy) = self.mark_chain_ready(id);
        if busy {
            self.scheduler.tasks[id.index()].rewake = true;
            self.request_pass(0);
            return;
        }
        if self.invoke(root) == TaskState::Ready {
            self.request_pass(1);
        }
    }

    /// Make sure a pass runs within `after` ticks
    fn request_pass(&mut self, after: Tick) {
        if self.scheduler.in_pass {
            // the pass re-arms itself when it finishes
            return;
        }
        match self.timers.remaining(self.scheduler.timer) {
            Ok(left) if left <= after => {}
            Ok(_) => self.arm_pass(after),
            Err(_) => fatal(Fatal::LostSchedulerTimer),
        }
    }

    fn arm_pass(&mut self, period: Tick) {
        let timer = self.scheduler.timer;
        let armed = self
            .timers
            .set_period(timer, period)
            .and_then(|()| self.timers.reset(timer));
        if armed.is_err() {
            fatal(Fatal::LostSchedulerTimer);
        }
    }
}

/// Scheduler timer callback: one pass over the top-level tasks
pub(crate) fn run_pass<A>(k: &mut Kernel<A>, _timer: TimerId, _: usize) {
    k.scheduler.in_pass = true;
    k.scheduler.passes += 1;
    let snapshot = k.scheduler.used;
    for idx in snapshot.iter() {
        let id = TaskId::from_index(idx);
        let runnable = k
            .scheduler
            .live(id)
            .is_some_and(|t| t.parent.is_none() && t.state == TaskState::Ready && !t.active);
        if runnable {
            k.invoke(id);
        }
    }
    k.scheduler.in_pass = false;
    let period = if k.scheduler.any_ready_root() { 1 } else { TIMER_INFINITY };
    k.arm_pass(period);
}

fn wake_on_timer<A>(k: &mut Kernel<A>, timer: TimerId, owner: usize) {
    let id = TaskId::from_index(owner);
    if !k.scheduler.live(id).is_some_and(|t| t.timer == Some(timer)) {
        fatal(Fatal::StaleOwner);
    }
    let task = &mut k.scheduler.tasks[id.index()];
    // one-shot: the timer slot is already free
    task.timer = None;
    task.wake = if task.subscriber.is_some() {
        Wake::TimedOut
    } else {
        Wake::Elapsed
    };
    trace!("task {} woken by timer", owner);
    k.cancel_wait(id);
    k.wake_chain(id);
}

fn wake_on_event<A>(k: &mut Kernel<A>, d: Delivery) {
    let id = TaskId::from_index(d.user_data);
    if !k.scheduler.live(id).is_some_and(|t| t.subscriber == Some(d.subscriber)) {
        fatal(Fatal::StaleOwner);
    }
    k.scheduler.tasks[id.index()].wake = Wake::Event(d.arg);
    trace!("task {} woken by event {}", d.user_data, d.event);
    k.cancel_wait(id);
    k.wake_chain(id);
}
