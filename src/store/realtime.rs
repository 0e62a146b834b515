//! Realtime event intake and batching.
//!
//! Adapters push events into a [`RealtimeSink`]. With a non-zero batch
//! interval, events land on an unbounded channel and a single timer task
//! flushes everything queued once the window closes, one state transition
//! per service. A zero interval applies each event as it arrives.
//!
//! Windows are numbered. A timer only flushes the window it was started for,
//! so a window closed early by a manual flush leaves its timer inert.

use super::Shared;
use crate::types::{EventKind, Item};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// A realtime change waiting to be applied.
#[derive(Clone, Debug)]
pub(crate) struct RealtimeEvent {
    pub(crate) service_name: Arc<str>,
    pub(crate) kind: EventKind,
    pub(crate) item: Item,
}

/// Handed to [`crate::Adapter::subscribe`]; forwards a service's realtime
/// events into the store.
///
/// The sink does not keep the store alive. Events emitted after the store is
/// dropped are discarded.
#[derive(Clone)]
pub struct RealtimeSink {
    service_name: Arc<str>,
    shared: Weak<Shared>,
}

impl RealtimeSink {
    pub(crate) fn new(service_name: &str, shared: Weak<Shared>) -> Self {
        Self {
            service_name: Arc::from(service_name),
            shared,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn emit(&self, kind: EventKind, item: Item) {
        let Some(shared) = self.shared.upgrade() else {
            trace!(service = %self.service_name, "store dropped; discarding realtime event");
            return;
        };
        shared.enqueue(RealtimeEvent {
            service_name: Arc::clone(&self.service_name),
            kind,
            item,
        });
    }

    pub fn created(&self, item: Item) {
        self.emit(EventKind::Created, item);
    }

    pub fn updated(&self, item: Item) {
        self.emit(EventKind::Updated, item);
    }

    pub fn patched(&self, item: Item) {
        self.emit(EventKind::Patched, item);
    }

    pub fn removed(&self, item: Item) {
        self.emit(EventKind::Removed, item);
    }
}

impl fmt::Debug for RealtimeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSink")
            .field("service_name", &self.service_name)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Pending realtime events, the "flush already scheduled" flag and the
/// number of the current window.
pub(crate) struct EventQueue {
    sender: Sender<RealtimeEvent>,
    receiver: Receiver<RealtimeEvent>,
    flush_scheduled: AtomicBool,
    window: AtomicU64,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            flush_scheduled: AtomicBool::new(false),
            window: AtomicU64::new(0),
        }
    }

    /// Queue an event. Returns the window to schedule a flush for when this
    /// event opened it.
    pub(crate) fn push(&self, event: RealtimeEvent) -> Option<u64> {
        // Both ends live in this struct, so the channel cannot be disconnected.
        let _ = self.sender.send(event);
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.window.load(Ordering::Acquire))
    }

    /// Close the current window and take everything queued. Events pushed
    /// after this call open a new window.
    pub(crate) fn drain(&self) -> Vec<RealtimeEvent> {
        self.window.fetch_add(1, Ordering::AcqRel);
        self.take()
    }

    /// Like [`EventQueue::drain`], but only while `window` is still open.
    pub(crate) fn drain_window(&self, window: u64) -> Vec<RealtimeEvent> {
        if self
            .window
            .compare_exchange(window, window + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(window, "window already flushed");
            return Vec::new();
        }
        self.take()
    }

    fn take(&self) -> Vec<RealtimeEvent> {
        self.flush_scheduled.store(false, Ordering::Release);
        self.receiver.try_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Group events by service. Services keep first-seen order; events keep
/// arrival order within their service.
pub(crate) fn group_by_service(events: Vec<RealtimeEvent>) -> Vec<(Arc<str>, Vec<(EventKind, Item)>)> {
    let mut groups: Vec<(Arc<str>, Vec<(EventKind, Item)>)> = Vec::new();
    for event in events {
        match groups
            .iter_mut()
            .find(|(service, _)| *service == event.service_name)
        {
            Some((_, batch)) => batch.push((event.kind, event.item)),
            None => groups.push((event.service_name, vec![(event.kind, event.item)])),
        }
    }
    groups
}
