use std::sync::{Arc, Mutex, MutexGuard};

use derive_more::{Deref, Display};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    command::{CommandNode, CommandType},
    context::ContextId,
    device::{Device, DeviceEvent},
    error::Error,
    platform,
};

/// Identifies a live event. Stale once the event's last reference is released.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{index}:{generation}")]
pub struct EventId {
    index: u32,
    generation: u32,
}

/// Lifecycle of a command. Only moves forward; `Complete` and `Failed` are terminal.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    #[display("Failed({_0})")]
    Failed(Error),
}

impl ExecutionStatus {
    #[inline]
    const fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Queued => 0,
            ExecutionStatus::Submitted => 1,
            ExecutionStatus::Running => 2,
            ExecutionStatus::Complete | ExecutionStatus::Failed(_) => 3,
        }
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Conventional numeric status: 3 queued down to 0 complete, negative on failure.
    pub const fn code(self) -> i32 {
        match self {
            ExecutionStatus::Queued => 3,
            ExecutionStatus::Submitted => 2,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Complete => 0,
            ExecutionStatus::Failed(err) => err.code(),
        }
    }
}

/// Device timestamps in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfilingInfo {
    pub queued: u64,
    pub submit: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    event: EventId,
    /// Failure of the predecessor fails the dependent. Implicit in-order edges only order.
    propagate: bool,
}

pub(crate) struct Submission {
    pub node: CommandNode,
    pub device: Device,
}

struct Entry {
    context: uid::Id<ContextId>,
    command: CommandType,
    status: ExecutionStatus,
    refs: usize,
    pending: usize,
    dependents: Vec<Edge>,
    /// Explicit predecessors this event holds a reference to until it is terminal.
    retained: Vec<EventId>,
    submission: Option<Submission>,
    waiters: Vec<flume::Sender<ExecutionStatus>>,
    profiling: Option<ProfilingInfo>,
    user: bool,
}

impl Entry {
    fn new(context: uid::Id<ContextId>, command: CommandType) -> Self {
        Self {
            context,
            command,
            status: ExecutionStatus::Queued,
            refs: 1,
            pending: 0,
            dependents: vec![],
            retained: vec![],
            submission: None,
            waiters: vec![],
            profiling: None,
            user: false,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

enum Step {
    Dispatch(EventId),
    Settle(EventId, ExecutionStatus, u64),
    Release(EventId),
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

impl Arena {
    fn get(&self, id: EventId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn get_mut(&mut self, id: EventId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn insert(&mut self, entry: Entry) -> EventId {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        EventId {
            index,
            generation: slot.generation,
        }
    }

    fn remove(&mut self, id: EventId) -> Option<Entry> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        Some(entry)
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Drains the work list. Returns commands dropped along the way, to be freed after unlocking.
    fn run(&mut self, mut work: Vec<Step>) -> Vec<Submission> {
        let mut dropped = vec![];

        while let Some(step) = work.pop() {
            match step {
                Step::Dispatch(id) => {
                    let Some(entry) = self.get_mut(id) else {
                        continue;
                    };
                    if entry.status != ExecutionStatus::Queued {
                        continue;
                    }
                    let Some(Submission { node, device }) = entry.submission.take() else {
                        continue;
                    };

                    let timestamp = device.ops().get_timer_value();
                    entry.status = ExecutionStatus::Submitted;
                    if let Some(profiling) = &mut entry.profiling {
                        profiling.submit = timestamp;
                    }
                    log::trace!("dispatch event {id} to device {}", device.id());

                    if let Err(DeviceEvent::Run { node, .. }) =
                        device.submit(DeviceEvent::Run { event: id, node })
                    {
                        log::error!("device {} is gone, failing event {id}", device.id());
                        dropped.push(Submission { node, device });
                        let status = ExecutionStatus::Failed(Error::DeviceNotAvailable);
                        work.push(Step::Settle(id, status, timestamp));
                    }
                }
                Step::Settle(id, status, timestamp) => {
                    let Some(entry) = self.get_mut(id) else {
                        continue;
                    };
                    if entry.status.is_terminal() {
                        log::warn!("event {id} is already {}, ignoring {status}", entry.status);
                        continue;
                    }

                    // 1. record the terminal status and wake waiters
                    entry.status = status;
                    if let Some(profiling) = &mut entry.profiling {
                        if profiling.start == 0 {
                            profiling.start = timestamp;
                        }
                        profiling.end = timestamp;
                    }
                    for waiter in entry.waiters.drain(..) {
                        _ = waiter.send(status);
                    }
                    // a command failed before dispatch never reaches its device
                    dropped.extend(entry.submission.take());
                    let dependents = std::mem::take(&mut entry.dependents);
                    let retained = std::mem::take(&mut entry.retained);

                    // 2. resolve edges to dependents; failures are pushed last so they run first
                    let mut failures = vec![];
                    for edge in dependents {
                        let Some(dependent) = self.get_mut(edge.event) else {
                            continue;
                        };
                        if dependent.status.is_terminal() {
                            continue;
                        }
                        match status {
                            ExecutionStatus::Failed(_) if edge.propagate => {
                                let status = ExecutionStatus::Failed(
                                    Error::ExecStatusErrorForEventsInWaitList,
                                );
                                failures.push(Step::Settle(edge.event, status, timestamp));
                            }
                            _ => {
                                dependent.pending -= 1;
                                if dependent.pending == 0 {
                                    work.push(Step::Dispatch(edge.event));
                                }
                            }
                        }
                    }
                    work.extend(failures);

                    // 3. drop references to explicit predecessors
                    work.extend(retained.into_iter().map(Step::Release));
                }
                Step::Release(id) => {
                    let Some(entry) = self.get_mut(id) else {
                        log::error!("release of stale event {id}");
                        continue;
                    };
                    entry.refs -= 1;
                    if entry.refs > 0 {
                        continue;
                    }
                    if let Some(entry) = self.remove(id) {
                        log::trace!("event {id} freed");
                        dropped.extend(entry.submission);
                        work.extend(entry.retained.into_iter().map(Step::Release));
                    }
                }
            }
        }

        dropped
    }
}

/// Owns every event: status, references, dependency edges and waiters.
///
/// All state sits behind one lock, so state transitions, reference counting and dispatch of
/// newly ready commands are atomic with respect to each other.
#[derive(Default)]
pub struct EventTracker {
    arena: Mutex<Arena>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().expect("failed to lock")
    }

    fn run(&self, mut arena: MutexGuard<'_, Arena>, work: Vec<Step>) {
        let dropped = arena.run(work);
        drop(arena);
        drop(dropped);
    }

    /// Registers a command and publishes it once its predecessors are done.
    ///
    /// `explicit` predecessors come from the wait list and propagate failure; `implicit` is the
    /// previous command of an in-order queue and only orders.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub(crate) fn submit(
        &self,
        context: uid::Id<ContextId>,
        submission: Submission,
        explicit: &[EventId],
        implicit: Option<EventId>,
        profiling: bool,
    ) -> Result<EventId, Error> {
        let mut arena = self.lock();
        if explicit.iter().any(|&pred| arena.get(pred).is_none()) {
            return Err(Error::InvalidEventWaitList);
        }

        let timestamp = submission.device.ops().get_timer_value();
        let mut entry = Entry::new(context, submission.node.kind.command_type());
        entry.retained = explicit.to_vec();
        entry.submission = Some(submission);
        entry.profiling = profiling.then(|| ProfilingInfo {
            queued: timestamp,
            ..Default::default()
        });
        let id = arena.insert(entry);

        let mut pending = 0;
        let mut failed = false;
        for &pred in explicit {
            let Some(pred) = arena.get_mut(pred) else {
                continue;
            };
            pred.refs += 1;
            match pred.status {
                ExecutionStatus::Complete => {}
                ExecutionStatus::Failed(_) => failed = true,
                _ => {
                    let edge = Edge {
                        event: id,
                        propagate: true,
                    };
                    pred.dependents.push(edge);
                    pending += 1;
                }
            }
        }
        let implicit = implicit
            .and_then(|pred| arena.get_mut(pred))
            .filter(|pred| !pred.status.is_terminal());
        if let Some(pred) = implicit {
            let edge = Edge {
                event: id,
                propagate: false,
            };
            pred.dependents.push(edge);
            pending += 1;
        }
        if let Some(entry) = arena.get_mut(id) {
            entry.pending = pending;
        }

        let work = match (failed, pending) {
            (true, _) => {
                let status = ExecutionStatus::Failed(Error::ExecStatusErrorForEventsInWaitList);
                vec![Step::Settle(id, status, timestamp)]
            }
            (false, 0) => vec![Step::Dispatch(id)],
            (false, _) => vec![],
        };
        self.run(arena, work);
        Ok(id)
    }

    /// Creates an event completed only by the host.
    pub(crate) fn create_user(&self, context: uid::Id<ContextId>) -> EventId {
        let mut entry = Entry::new(context, CommandType::User);
        entry.status = ExecutionStatus::Submitted;
        entry.user = true;
        self.lock().insert(entry)
    }

    pub(crate) fn set_user_status(
        &self,
        id: EventId,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        let arena = self.lock();
        let entry = arena.get(id).ok_or(Error::InvalidEvent)?;
        if !entry.user {
            return Err(Error::InvalidEvent);
        }
        if entry.status.is_terminal() {
            return Err(Error::InvalidOperation);
        }
        let status = match result {
            Ok(()) => ExecutionStatus::Complete,
            Err(err) => ExecutionStatus::Failed(err),
        };
        self.run(arena, vec![Step::Settle(id, status, platform::timestamp())]);
        Ok(())
    }

    /// Marks a dispatched command as running on its device.
    pub(crate) fn start(&self, id: EventId, timestamp: u64) {
        let mut arena = self.lock();
        let Some(entry) = arena.get_mut(id) else {
            log::error!("start of stale event {id}");
            return;
        };
        if entry.status.rank() >= ExecutionStatus::Running.rank() {
            log::warn!("event {id} is already {}, ignoring start", entry.status);
            return;
        }
        entry.status = ExecutionStatus::Running;
        if let Some(profiling) = &mut entry.profiling {
            profiling.start = timestamp;
        }
    }

    /// Records the outcome of a command and releases everything waiting on it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub(crate) fn finish(&self, id: EventId, result: Result<(), Error>, timestamp: u64) {
        let status = match result {
            Ok(()) => ExecutionStatus::Complete,
            Err(err) => ExecutionStatus::Failed(err),
        };
        let arena = self.lock();
        self.run(arena, vec![Step::Settle(id, status, timestamp)]);
    }

    pub(crate) fn retain(&self, id: EventId) -> Result<(), Error> {
        let mut arena = self.lock();
        let entry = arena.get_mut(id).ok_or(Error::InvalidEvent)?;
        entry.refs += 1;
        Ok(())
    }

    pub(crate) fn release(&self, id: EventId) -> Result<(), Error> {
        let arena = self.lock();
        if arena.get(id).is_none() {
            return Err(Error::InvalidEvent);
        }
        self.run(arena, vec![Step::Release(id)]);
        Ok(())
    }

    pub fn status(&self, id: EventId) -> Result<ExecutionStatus, Error> {
        let arena = self.lock();
        arena.get(id).map(|entry| entry.status).ok_or(Error::InvalidEvent)
    }

    pub fn reference_count(&self, id: EventId) -> Result<usize, Error> {
        let arena = self.lock();
        arena.get(id).map(|entry| entry.refs).ok_or(Error::InvalidEvent)
    }

    pub fn command_type(&self, id: EventId) -> Result<CommandType, Error> {
        let arena = self.lock();
        arena.get(id).map(|entry| entry.command).ok_or(Error::InvalidEvent)
    }

    pub fn context(&self, id: EventId) -> Result<uid::Id<ContextId>, Error> {
        let arena = self.lock();
        arena.get(id).map(|entry| entry.context).ok_or(Error::InvalidEvent)
    }

    pub fn profiling_info(&self, id: EventId) -> Result<ProfilingInfo, Error> {
        let arena = self.lock();
        let entry = arena.get(id).ok_or(Error::InvalidEvent)?;
        match (entry.status, entry.profiling) {
            (ExecutionStatus::Complete, Some(profiling)) => Ok(profiling),
            _ => Err(Error::ProfilingInfoNotAvailable),
        }
    }

    /// A channel that yields the event's terminal status exactly once.
    pub fn subscribe(&self, id: EventId) -> Result<flume::Receiver<ExecutionStatus>, Error> {
        let mut arena = self.lock();
        let entry = arena.get_mut(id).ok_or(Error::InvalidEvent)?;
        let (sender, receiver) = flume::bounded(1);
        match entry.status.is_terminal() {
            true => _ = sender.send(entry.status),
            false => entry.waiters.push(sender),
        }
        Ok(receiver)
    }

    /// Number of live events.
    pub fn live(&self) -> usize {
        self.lock().live()
    }
}

impl std::fmt::Debug for EventTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTracker")
            .field("live", &self.live())
            .finish()
    }
}

#[inline]
fn outcome(status: Result<ExecutionStatus, flume::RecvError>) -> Result<(), Error> {
    match status {
        Ok(ExecutionStatus::Failed(_)) => Err(Error::ExecStatusErrorForEventsInWaitList),
        Ok(_) => Ok(()),
        Err(_) => Err(Error::InvalidEvent),
    }
}

/// Reference-counted handle to an event. Cloning retains, dropping releases.
pub struct Event {
    id: EventId,
    tracker: Arc<EventTracker>,
}

impl Event {
    /// Adopts one reference already counted by the tracker.
    pub(crate) fn from_raw(id: EventId, tracker: Arc<EventTracker>) -> Self {
        Self { id, tracker }
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.tracker
            .status(self.id)
            .expect("event handle must be live")
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Blocks until the command finishes. Fails if it or a predecessor failed.
    pub fn wait(&self) -> Result<(), Error> {
        let receiver = self.tracker.subscribe(self.id)?;
        outcome(receiver.recv())
    }

    pub async fn wait_async(&self) -> Result<(), Error> {
        let receiver = self.tracker.subscribe(self.id)?;
        outcome(receiver.recv_async().await)
    }

    pub fn reference_count(&self) -> usize {
        self.tracker.reference_count(self.id).unwrap_or_default()
    }

    pub fn command_type(&self) -> CommandType {
        self.tracker
            .command_type(self.id)
            .expect("event handle must be live")
    }

    pub fn context(&self) -> uid::Id<ContextId> {
        self.tracker
            .context(self.id)
            .expect("event handle must be live")
    }

    /// Timestamps of a completed command from a queue with profiling enabled.
    pub fn profiling_info(&self) -> Result<ProfilingInfo, Error> {
        self.tracker.profiling_info(self.id)
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        if let Err(err) = self.tracker.retain(self.id) {
            log::error!("failed to retain event {}: {err}", self.id);
        }
        Self {
            id: self.id,
            tracker: self.tracker.clone(),
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(err) = self.tracker.release(self.id) {
            log::error!("failed to release event {}: {err}", self.id);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("status", &self.tracker.status(self.id))
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.tracker, &other.tracker)
    }
}

impl Eq for Event {}

/// An event whose completion is set by the host.
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct UserEvent(Event);

impl UserEvent {
    pub(crate) fn new(event: Event) -> Self {
        Self(event)
    }

    /// Completes (`Ok`) or fails the event. May be called once.
    pub fn set_status(&self, result: Result<(), Error>) -> Result<(), Error> {
        self.0.tracker.set_user_status(self.0.id, result)
    }

    #[inline]
    pub fn event(&self) -> &Event {
        &self.0
    }
}

/// Blocks until every event finishes. All events must share one context.
pub fn wait_for_events(events: &[Event]) -> Result<(), Error> {
    let Some(first) = events.first() else {
        return Err(Error::InvalidValue);
    };
    let context = first.context();
    if events.iter().any(|event| event.context() != context) {
        return Err(Error::InvalidContext);
    }
    events
        .iter()
        .map(Event::wait)
        .fold(Ok(()), |result, outcome| result.and(outcome))
}
