//! In-memory observation source.
//!
//! [`MemoryStore`] keeps an append-only event log in process memory and
//! materializes entities on demand. Every observation folds the log from the
//! start, then follows new appends through a `watch` channel carrying the
//! log head. Notifications coalesce: one emitted state may cover several
//! appended events.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::error::{EmitError, ObserveError};
use crate::event::{StoredEvent, Tags};
use crate::source::{EntitySpec, Observation, ObservationSource};

/// In-memory [`ObservationSource`].
///
/// `Clone` is cheap: all state is `Arc`-wrapped and shared between clones.
///
/// # Examples
///
/// ```
/// use eventfold_registry::{MemoryStore, ObservationSource, Tags};
///
/// let store = MemoryStore::new();
/// let offset = store.emit(Tags::new("chat"), &"hello").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    log: RwLock<Vec<StoredEvent>>,
    /// Number of events in the log. Bumped after every append.
    head: watch::Sender<u64>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Vec::new()),
                head,
            }),
        }
    }

    /// Number of events in the log.
    ///
    /// Still counts the log if a writer panicked while holding the lock;
    /// appends never leave it half-written.
    pub fn len(&self) -> usize {
        match self.inner.log.read() {
            Ok(log) => log.len(),
            Err(poisoned) => {
                tracing::warn!("event log lock poisoned, counting anyway");
                poisoned.into_inner().len()
            }
        }
    }

    /// Whether no event has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored event, in log order.
    ///
    /// # Errors
    ///
    /// Returns [`ObserveError::Poisoned`] if a writer panicked while holding
    /// the log lock.
    pub fn events(&self) -> Result<Vec<StoredEvent>, ObserveError> {
        self.inner
            .log
            .read()
            .map(|log| log.clone())
            .map_err(|_| ObserveError::Poisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// Manual `Debug` so the whole log is not dumped.
impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len())
            .finish()
    }
}

/// Fold cursor of one observation.
struct Materialized<S, E> {
    spec: EntitySpec<S, E>,
    state: Option<S>,
    cursor: usize,
    emitted: bool,
}

impl<S: Clone, E: DeserializeOwned> Materialized<S, E> {
    /// Fold every selected event past the cursor.
    ///
    /// Returns the new state when it should be emitted: the first call always
    /// emits, later calls only when at least one event was folded.
    fn advance(&mut self, log: &[StoredEvent]) -> Option<S> {
        let mut folded = false;
        for stored in log.iter().skip(self.cursor) {
            if !self.spec.selector.matches(&stored.tags) {
                continue;
            }
            match serde_json::from_value::<E>(stored.payload.clone()) {
                Ok(event) => {
                    self.state = self.state.take().map(|s| (self.spec.fold)(s, &event));
                    folded = true;
                }
                // Selected but not ours to decode -- skip, like unknown events.
                Err(e) => tracing::trace!(
                    entity = %self.spec.key,
                    offset = stored.offset,
                    error = %e,
                    "skipping undecodable event"
                ),
            }
        }
        self.cursor = log.len();

        if folded || !self.emitted {
            self.emitted = true;
            self.state.clone()
        } else {
            None
        }
    }
}

impl ObservationSource for MemoryStore {
    fn observe<S, E>(&self, spec: EntitySpec<S, E>) -> Observation<S>
    where
        S: Clone + Send + Sync + 'static,
        E: DeserializeOwned + Send + 'static,
    {
        tracing::debug!(entity = %spec.key, "observing entity");

        let inner = Arc::clone(&self.inner);
        let mut materialized = Materialized {
            state: Some(spec.initial_state.clone()),
            spec,
            cursor: 0,
            emitted: false,
        };

        // `WatchStream` yields the current head first, so the folded state is
        // delivered on the first poll even if nothing is appended afterwards.
        let stream = WatchStream::new(self.inner.head.subscribe()).filter_map(move |_head| {
            match inner.log.read() {
                Ok(log) => materialized.advance(&log).map(Ok),
                Err(_) => Some(Err(ObserveError::Poisoned)),
            }
        });
        Box::pin(stream)
    }

    fn emit<E: Serialize>(&self, tags: Tags, payload: &E) -> Result<u64, EmitError> {
        let payload = serde_json::to_value(payload)?;
        let (offset, head) = {
            let mut log = self.inner.log.write().map_err(|_| EmitError::Poisoned)?;
            let offset = log.len() as u64;
            log.push(StoredEvent {
                offset,
                tags,
                payload,
            });
            (offset, log.len() as u64)
        };
        // `send_replace` updates the value even when nobody is subscribed.
        self.inner.head.send_replace(head);
        tracing::debug!(offset, "event appended");
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::source::EntityKey;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "camelCase")]
    enum CounterEvent {
        Added { amount: u64 },
    }

    fn counter(name: &str) -> EntitySpec<u64, CounterEvent> {
        EntitySpec::new(
            EntityKey::new("counter", name, 0),
            0,
            Tags::new("counter").with_id(name),
            |state, event: &CounterEvent| match event {
                CounterEvent::Added { amount } => state + amount,
            },
        )
    }

    async fn next_state(obs: &mut Observation<u64>) -> Option<u64> {
        tokio::time::timeout(Duration::from_millis(100), obs.next())
            .await
            .ok()
            .flatten()
            .map(|r| r.expect("observation should not fail"))
    }

    #[tokio::test]
    async fn first_emission_is_initial_state() {
        let store = MemoryStore::new();
        let mut obs = store.observe(counter("a"));
        assert_eq!(next_state(&mut obs).await, Some(0));
        // Nothing appended, nothing more to see.
        assert_eq!(next_state(&mut obs).await, None);
    }

    #[tokio::test]
    async fn late_subscriber_sees_folded_state() {
        let store = MemoryStore::new();
        let tags = Tags::new("counter").with_id("a");
        store.emit(tags.clone(), &CounterEvent::Added { amount: 2 }).unwrap();
        store.emit(tags, &CounterEvent::Added { amount: 3 }).unwrap();

        let mut obs = store.observe(counter("a"));
        assert_eq!(next_state(&mut obs).await, Some(5));
    }

    #[tokio::test]
    async fn follows_new_events() {
        let store = MemoryStore::new();
        let mut obs = store.observe(counter("a"));
        assert_eq!(next_state(&mut obs).await, Some(0));

        store
            .emit(Tags::new("counter").with_id("a"), &CounterEvent::Added { amount: 7 })
            .unwrap();
        assert_eq!(next_state(&mut obs).await, Some(7));
    }

    #[tokio::test]
    async fn unselected_events_do_not_emit() {
        let store = MemoryStore::new();
        let mut obs = store.observe(counter("a"));
        assert_eq!(next_state(&mut obs).await, Some(0));

        store
            .emit(Tags::new("counter").with_id("b"), &CounterEvent::Added { amount: 7 })
            .unwrap();
        assert_eq!(next_state(&mut obs).await, None);
    }

    #[tokio::test]
    async fn undecodable_events_are_skipped() {
        let store = MemoryStore::new();
        let tags = Tags::new("counter").with_id("a");
        store.emit(tags.clone(), &"not a counter event").unwrap();
        store.emit(tags, &CounterEvent::Added { amount: 1 }).unwrap();

        let mut obs = store.observe(counter("a"));
        assert_eq!(next_state(&mut obs).await, Some(1));
    }

    #[test]
    fn emit_assigns_sequential_offsets() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.emit(Tags::new("x"), &1).unwrap(), 0);
        assert_eq!(store.emit(Tags::new("x"), &2).unwrap(), 1);

        let events = store.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, serde_json::json!(2));
        assert!(events[1].tags.contains("x"));
    }

    #[test]
    fn poisoned_log_still_counts() {
        let store = MemoryStore::new();
        store.emit(Tags::new("x"), &1).unwrap();
        store.emit(Tags::new("x"), &2).unwrap();

        let inner = Arc::clone(&store.inner);
        let writer = std::thread::spawn(move || {
            let _guard = inner.log.write().unwrap();
            panic!("writer died holding the log");
        });
        assert!(writer.join().is_err());

        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        assert!(matches!(store.events(), Err(ObserveError::Poisoned)));
    }
}
