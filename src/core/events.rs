//! Update, commit and rollback event streams
//!
//! The engine's change hooks feed an [`EventHub`] owned by the connection.
//! Each subscriber gets its own channel plus pause/cancel flags that are
//! checked when an event is emitted: a paused subscriber simply misses the
//! event, nothing is buffered for it and nothing is replayed on resume.
//! Channels are bounded; when a subscriber falls that far behind, new events
//! are dropped for it and counted, and the writer never waits on a reader.
//! Hooks are installed while at least one subscriber needs them.

use super::connection::Connection;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Insert,
    Update,
    Delete,
}

impl UpdateKind {
    fn from_raw(op: c_int) -> Option<Self> {
        match op {
            ffi::SQLITE_INSERT => Some(UpdateKind::Insert),
            ffi::SQLITE_UPDATE => Some(UpdateKind::Update),
            ffi::SQLITE_DELETE => Some(UpdateKind::Delete),
            _ => None,
        }
    }
}

/// One row-level change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub kind: UpdateKind,
    pub table: String,
    pub rowid: i64,
}

/// A transaction committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEvent;

/// A transaction rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackEvent;

/// Which hook a stream is fed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Commit,
    Rollback,
}

/// Events buffered per subscriber unless configured otherwise
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SlotControl {
    paused: AtomicBool,
    closed: AtomicBool,
    overflowed: AtomicU64,
}

struct Slot<T> {
    id: u64,
    tx: Sender<T>,
    control: Arc<SlotControl>,
}

#[doc(hidden)]
pub struct Channel<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T: Clone> Channel<T> {
    fn emit(&mut self, event: &T) {
        self.slots.retain(|slot| {
            if slot.control.closed.load(Ordering::Acquire) {
                return false;
            }
            if slot.control.paused.load(Ordering::Acquire) {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.control.overflowed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                // a dropped receiver closes the slot
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    fn remove(&mut self, id: u64) {
        self.slots.retain(|slot| slot.id != id);
    }

    fn close_all(&mut self) {
        for slot in self.slots.drain(..) {
            slot.control.closed.store(true, Ordering::Release);
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Predicate consulted before each commit; `false` turns it into a rollback
pub type CommitFilter = Arc<dyn Fn() -> bool + Send + Sync>;

#[doc(hidden)]
#[derive(Default)]
pub struct HubState {
    updates: Channel<UpdateEvent>,
    commits: Channel<CommitEvent>,
    rollbacks: Channel<RollbackEvent>,
    commit_filter: Option<CommitFilter>,
    next_id: u64,
}

/// Event types that have a stream
pub trait Event: Clone + Send + 'static {
    #[doc(hidden)]
    const KIND: EventKind;
    #[doc(hidden)]
    fn channel(state: &mut HubState) -> &mut Channel<Self>;
}

impl Event for UpdateEvent {
    const KIND: EventKind = EventKind::Update;

    fn channel(state: &mut HubState) -> &mut Channel<Self> {
        &mut state.updates
    }
}

impl Event for CommitEvent {
    const KIND: EventKind = EventKind::Commit;

    fn channel(state: &mut HubState) -> &mut Channel<Self> {
        &mut state.commits
    }
}

impl Event for RollbackEvent {
    const KIND: EventKind = EventKind::Rollback;

    fn channel(state: &mut HubState) -> &mut Channel<Self> {
        &mut state.rollbacks
    }
}

/// Hooks that currently need to be installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HookDemand {
    pub update: bool,
    pub commit: bool,
    pub rollback: bool,
}

/// Subscriber registry of one connection
pub(crate) struct EventHub {
    state: Mutex<HubState>,
    capacity: usize,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Hub whose subscribers buffer at most `capacity` events each
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe<T: Event>(&self, owner: Weak<Connection>) -> Subscription<T> {
        let (tx, rx) = channel::bounded(self.capacity);
        let control = Arc::new(SlotControl::default());
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        T::channel(&mut state).slots.push(Slot {
            id,
            tx,
            control: control.clone(),
        });
        debug!("Added {:?} subscriber {}", T::KIND, id);

        Subscription {
            rx,
            control,
            owner,
            id,
        }
    }

    pub fn unsubscribe<T: Event>(&self, id: u64) {
        T::channel(&mut self.state.lock()).remove(id);
    }

    pub fn set_commit_filter(&self, filter: Option<CommitFilter>) {
        self.state.lock().commit_filter = filter;
    }

    pub fn demand(&self) -> HookDemand {
        let state = self.state.lock();
        HookDemand {
            update: !state.updates.is_empty(),
            commit: !state.commits.is_empty() || state.commit_filter.is_some(),
            rollback: !state.rollbacks.is_empty(),
        }
    }

    /// Close every stream and drop the commit filter
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.updates.close_all();
        state.commits.close_all();
        state.rollbacks.close_all();
        state.commit_filter = None;
    }

    fn emit_update(&self, event: UpdateEvent) {
        self.state.lock().updates.emit(&event);
    }

    /// Returns true to let the commit proceed
    fn on_commit(&self) -> bool {
        let filter = self.state.lock().commit_filter.clone();
        // filter runs without the hub lock so it may touch subscriptions
        let allowed = match filter {
            Some(filter) => catch_unwind(AssertUnwindSafe(|| filter())).unwrap_or_else(|_| {
                warn!("Commit filter panicked, rolling back");
                false
            }),
            None => true,
        };
        if allowed {
            self.state.lock().commits.emit(&CommitEvent);
        }
        allowed
    }

    fn emit_rollback(&self) {
        self.state.lock().rollbacks.emit(&RollbackEvent);
    }
}

/// Receiving end of an event stream
///
/// Dropping the subscription cancels it.
pub struct Subscription<T: Event> {
    rx: Receiver<T>,
    control: Arc<SlotControl>,
    owner: Weak<Connection>,
    id: u64,
}

impl<T: Event> Subscription<T> {
    /// Stop receiving; events raised while paused are lost
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    /// Events lost because this subscriber's buffer was full
    pub fn overflowed(&self) -> u64 {
        self.control.overflowed.load(Ordering::Relaxed)
    }

    /// Unsubscribe and close the stream
    pub fn cancel(&self) {
        if self.control.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.owner.upgrade() {
            conn.unsubscribe::<T>(self.id);
        }
    }

    /// True once cancelled or once the owning database was disposed
    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::Acquire)
    }

    /// Next buffered event, without blocking
    pub fn try_next(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// All buffered events
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Blocking iterator; ends when the stream is closed
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.iter()
    }
}

impl<T: Event> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T: Event> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &T::KIND)
            .field("id", &self.id)
            .field("paused", &self.is_paused())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Engine hooks; `arg` is the connection's `EventHub`

pub(crate) unsafe extern "C" fn update_hook(
    arg: *mut c_void,
    op: c_int,
    _db_name: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    let hub = &*(arg as *const EventHub);
    let Some(kind) = UpdateKind::from_raw(op) else {
        return;
    };
    let table = if table.is_null() {
        String::new()
    } else {
        CStr::from_ptr(table).to_string_lossy().into_owned()
    };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        hub.emit_update(UpdateEvent { kind, table, rowid })
    }));
}

pub(crate) unsafe extern "C" fn commit_hook(arg: *mut c_void) -> c_int {
    let hub = &*(arg as *const EventHub);
    if hub.on_commit() {
        0
    } else {
        1
    }
}

pub(crate) unsafe extern "C" fn rollback_hook(arg: *mut c_void) {
    let hub = &*(arg as *const EventHub);
    let _ = catch_unwind(AssertUnwindSafe(|| hub.emit_rollback()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_update_subscriber() -> (EventHub, Subscription<UpdateEvent>) {
        let hub = EventHub::new();
        let sub = hub.subscribe::<UpdateEvent>(Weak::new());
        (hub, sub)
    }

    fn insert(rowid: i64) -> UpdateEvent {
        UpdateEvent {
            kind: UpdateKind::Insert,
            table: "t".into(),
            rowid,
        }
    }

    #[test]
    fn test_paused_subscriber_drops_events() {
        let (hub, sub) = hub_with_update_subscriber();
        hub.emit_update(insert(1));
        sub.pause();
        hub.emit_update(insert(2));
        sub.resume();
        hub.emit_update(insert(3));

        let rowids: Vec<i64> = sub.drain().into_iter().map(|e| e.rowid).collect();
        assert_eq!(rowids, vec![1, 3]);
    }

    #[test]
    fn test_full_buffer_drops_without_blocking() {
        let hub = EventHub::with_capacity(2);
        let sub = hub.subscribe::<UpdateEvent>(Weak::new());
        for rowid in 1..=5 {
            hub.emit_update(insert(rowid));
        }
        assert_eq!(sub.overflowed(), 3);
        assert!(!sub.is_closed());

        let rowids: Vec<i64> = sub.drain().into_iter().map(|e| e.rowid).collect();
        assert_eq!(rowids, vec![1, 2]);
        hub.emit_update(insert(6));
        assert_eq!(sub.try_next(), Some(insert(6)));
    }

    #[test]
    fn test_cancel_closes_stream() {
        let (hub, sub) = hub_with_update_subscriber();
        sub.cancel();
        assert!(sub.is_closed());
        hub.emit_update(insert(1));
        assert!(sub.try_next().is_none());
        assert!(!hub.demand().update);
    }

    #[test]
    fn test_close_all_ends_iteration() {
        let (hub, sub) = hub_with_update_subscriber();
        hub.emit_update(insert(7));
        hub.close_all();
        assert!(sub.is_closed());
        // buffered events remain readable, then the iterator ends
        let rest: Vec<UpdateEvent> = sub.iter().collect();
        assert_eq!(rest, vec![insert(7)]);
    }

    #[test]
    fn test_demand_tracks_filter() {
        let hub = EventHub::new();
        assert_eq!(hub.demand(), HookDemand::default());
        hub.set_commit_filter(Some(Arc::new(|| true)));
        assert!(hub.demand().commit);
        hub.set_commit_filter(None);
        assert!(!hub.demand().commit);
    }

    #[test]
    fn test_commit_filter_veto_suppresses_event() {
        let hub = EventHub::new();
        let sub = hub.subscribe::<CommitEvent>(Weak::new());
        hub.set_commit_filter(Some(Arc::new(|| false)));
        assert!(!hub.on_commit());
        assert!(sub.try_next().is_none());

        hub.set_commit_filter(Some(Arc::new(|| panic!("filter failure"))));
        assert!(!hub.on_commit());

        hub.set_commit_filter(None);
        assert!(hub.on_commit());
        assert_eq!(sub.try_next(), Some(CommitEvent));
    }
}
