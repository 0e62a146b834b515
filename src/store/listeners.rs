//! Listener registry and deferred notification.
//!
//! Listeners are collected while the state lock is held and invoked only
//! after it is released, so a listener may freely call back into the store.
//! Every batch of calls carries the number of the transition that produced
//! it; a listener that has already seen a later transition skips it.

use super::service::StoreSnapshot;
use crate::query::QueryId;
use crate::types::QueryState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Called with the query's new state after each notifying transition.
pub type QueryListener = Arc<dyn Fn(&Arc<QueryState>) + Send + Sync>;

/// Called with a snapshot of the whole store after each notifying transition.
pub type StateListener = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

/// Identifier returned when registering a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A registered listener and the latest transition handed to it.
#[derive(Clone)]
pub(crate) struct Registered<L> {
    id: ListenerId,
    listener: L,
    seen: Arc<AtomicU64>,
}

impl<L> Registered<L> {
    fn new(id: ListenerId, listener: L) -> Self {
        Self {
            id,
            listener,
            seen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Claim delivery of `transition`. False when it is not newer than what
    /// this listener already received.
    fn claim(&self, transition: u64) -> bool {
        self.seen.fetch_max(transition, Ordering::AcqRel) < transition
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    by_query: HashMap<QueryId, Vec<Registered<QueryListener>>>,
    state: Vec<Registered<StateListener>>,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub(crate) fn add_query(&mut self, query_id: &QueryId, listener: QueryListener) -> ListenerId {
        let id = self.next_id();
        self.by_query
            .entry(query_id.clone())
            .or_default()
            .push(Registered::new(id, listener));
        id
    }

    /// Remove a query listener and return how many remain for that query.
    pub(crate) fn remove_query(&mut self, query_id: &QueryId, id: ListenerId) -> usize {
        let Some(listeners) = self.by_query.get_mut(query_id) else {
            return 0;
        };
        listeners.retain(|entry| entry.id != id);
        let remaining = listeners.len();
        if remaining == 0 {
            self.by_query.remove(query_id);
        }
        remaining
    }

    pub(crate) fn count(&self, query_id: &QueryId) -> usize {
        self.by_query.get(query_id).map_or(0, Vec::len)
    }

    pub(crate) fn for_query(
        &self,
        query_id: &QueryId,
    ) -> impl Iterator<Item = &Registered<QueryListener>> {
        self.by_query.get(query_id).into_iter().flatten()
    }

    pub(crate) fn add_state(&mut self, listener: StateListener) -> ListenerId {
        let id = self.next_id();
        self.state.push(Registered::new(id, listener));
        id
    }

    pub(crate) fn remove_state(&mut self, id: ListenerId) {
        self.state.retain(|entry| entry.id != id);
    }

    pub(crate) fn has_state_listeners(&self) -> bool {
        !self.state.is_empty()
    }

    pub(crate) fn state_listeners(&self) -> Vec<Registered<StateListener>> {
        self.state.clone()
    }
}

/// Listener calls gathered under the lock, run by [`Notifications::dispatch`].
#[must_use = "notifications do nothing unless dispatched"]
#[derive(Default)]
pub(crate) struct Notifications {
    pub(crate) transition: u64,
    pub(crate) queries: Vec<(Registered<QueryListener>, Arc<QueryState>)>,
    pub(crate) state: Vec<Registered<StateListener>>,
    pub(crate) snapshot: Option<StoreSnapshot>,
}

impl Notifications {
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn at(transition: u64) -> Self {
        Self {
            transition,
            ..Self::default()
        }
    }

    pub(crate) fn dispatch(self) {
        for (entry, state) in self.queries {
            if entry.claim(self.transition) {
                (entry.listener)(&state);
            }
        }
        if let Some(snapshot) = self.snapshot {
            for entry in self.state {
                if entry.claim(self.transition) {
                    (entry.listener)(&snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryId, QueryOptions};
    use crate::types::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn query_id() -> QueryId {
        let (desc, config) = QueryOptions::new().split("notes", Method::Find, None);
        QueryId::compute(&desc, &config)
    }

    #[test]
    fn test_remove_reports_remaining() {
        let mut listeners = Listeners::default();
        let qid = query_id();

        let a = listeners.add_query(&qid, Arc::new(|_: &Arc<QueryState>| {}));
        let b = listeners.add_query(&qid, Arc::new(|_: &Arc<QueryState>| {}));
        assert_ne!(a, b);
        assert_eq!(listeners.count(&qid), 2);

        assert_eq!(listeners.remove_query(&qid, a), 1);
        assert_eq!(listeners.remove_query(&qid, b), 0);
        assert_eq!(listeners.count(&qid), 0);
        assert_eq!(listeners.remove_query(&qid, b), 0);
    }

    #[test]
    fn test_dispatch_runs_each_listener_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let listener: QueryListener = Arc::new(move |_: &Arc<QueryState>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let entry = Registered::new(ListenerId(1), listener);
        let state = Arc::new(QueryState::initial(false));

        let mut notifications = Notifications::at(1);
        notifications.queries.push((entry.clone(), Arc::clone(&state)));
        notifications.dispatch();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_skips_older_transition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let listener: QueryListener = Arc::new(move |_: &Arc<QueryState>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let entry = Registered::new(ListenerId(1), listener);
        let state = Arc::new(QueryState::initial(false));

        // Transition 3 is dispatched before transition 2 finishes dispatching
        let mut newer = Notifications::at(3);
        newer.queries.push((entry.clone(), Arc::clone(&state)));
        let mut older = Notifications::at(2);
        older.queries.push((entry.clone(), Arc::clone(&state)));

        newer.dispatch();
        older.dispatch();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut next = Notifications::at(4);
        next.queries.push((entry, state));
        next.dispatch();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
