//! The interface this crate needs from an event-sourced host runtime.
//!
//! A host materializes entities: given an [`EntitySpec`] it folds every
//! selected event into the entity's state and pushes each new state to the
//! observer. Registries are themselves entities, so the same interface is
//! used both for the membership fold and for the registered entities.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_stream::Stream;

use crate::error::{EmitError, ObserveError};
use crate::event::{Tags, Where};

/// Opaque string naming one entity within a registry.
pub type Identifier = String;

/// A live, push-based sequence of values.
///
/// Observations are cold: each one starts its own synchronization with the
/// source. Dropping an observation cancels it. Live observations normally
/// never complete; an `Err` item is terminal.
pub type Observation<T> = Pin<Box<dyn Stream<Item = Result<T, ObserveError>> + Send>>;

/// Fold function turning the current state and one event into the next state.
pub type FoldFn<S, E> = Arc<dyn Fn(S, &E) -> S + Send + Sync>;

/// Stable identity of an entity, used by hosts for caching and routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey {
    /// Kind of entity, e.g. `"chat-room"`.
    pub entity_type: String,
    /// Instance name within the kind.
    pub name: String,
    /// Bump when the fold logic changes incompatibly.
    pub version: u32,
}

impl EntityKey {
    /// Build a key from its parts.
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.entity_type, self.name, self.version)
    }
}

/// Everything a host needs to materialize one entity.
///
/// # Type Parameters
///
/// * `S` - Entity state.
/// * `E` - Event type the fold consumes. Selected events that do not decode
///   into `E` are skipped by the host.
pub struct EntitySpec<S, E> {
    /// Entity identity.
    pub key: EntityKey,
    /// State before any event has been folded.
    pub initial_state: S,
    /// Which events the entity folds.
    pub selector: Where,
    /// The fold itself.
    pub fold: FoldFn<S, E>,
}

impl<S, E> EntitySpec<S, E> {
    /// Build a spec from a plain fold closure.
    pub fn new<F>(key: EntityKey, initial_state: S, selector: impl Into<Where>, fold: F) -> Self
    where
        F: Fn(S, &E) -> S + Send + Sync + 'static,
    {
        Self {
            key,
            initial_state,
            selector: selector.into(),
            fold: Arc::new(fold),
        }
    }
}

// Manual `Clone`: the fold is shared, `E` need not be `Clone`.
impl<S: Clone, E> Clone for EntitySpec<S, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            initial_state: self.initial_state.clone(),
            selector: self.selector.clone(),
            fold: Arc::clone(&self.fold),
        }
    }
}

impl<S, E> fmt::Debug for EntitySpec<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySpec")
            .field("key", &self.key)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

/// Host runtime access used by registries.
///
/// # Contract
///
/// - [`observe`](ObservationSource::observe) yields the state folded over
///   every selected event delivered so far, then a new state each time more
///   selected events arrive, in log order.
/// - Observing the same [`EntityKey`] twice must yield consistent states.
///   Whether the host shares the underlying materialization is up to it.
/// - [`emit`](ObservationSource::emit) appends an event that becomes visible
///   to every observation whose selector matches `tags`.
pub trait ObservationSource: Send + Sync {
    /// Start observing an entity.
    fn observe<S, E>(&self, spec: EntitySpec<S, E>) -> Observation<S>
    where
        S: Clone + Send + Sync + 'static,
        E: DeserializeOwned + Send + 'static;

    /// Append an event tagged with `tags`, returning its log offset.
    ///
    /// # Errors
    ///
    /// * [`EmitError::Encode`] -- the payload could not be serialized.
    /// * [`EmitError::Poisoned`] -- the log is unusable.
    fn emit<E: Serialize>(&self, tags: Tags, payload: &E) -> Result<u64, EmitError>;
}

impl<T: ObservationSource> ObservationSource for Arc<T> {
    fn observe<S, E>(&self, spec: EntitySpec<S, E>) -> Observation<S>
    where
        S: Clone + Send + Sync + 'static,
        E: DeserializeOwned + Send + 'static,
    {
        (**self).observe(spec)
    }

    fn emit<E: Serialize>(&self, tags: Tags, payload: &E) -> Result<u64, EmitError> {
        (**self).emit(tags, payload)
    }
}

impl<T: ObservationSource> ObservationSource for &T {
    fn observe<S, E>(&self, spec: EntitySpec<S, E>) -> Observation<S>
    where
        S: Clone + Send + Sync + 'static,
        E: DeserializeOwned + Send + 'static,
    {
        (**self).observe(spec)
    }

    fn emit<E: Serialize>(&self, tags: Tags, payload: &E) -> Result<u64, EmitError> {
        (**self).emit(tags, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_display() {
        let key = EntityKey::new("chat-room", "lobby", 0);
        assert_eq!(key.to_string(), "chat-room/lobby@0");
    }

    #[test]
    fn spec_clone_shares_fold() {
        let spec: EntitySpec<u32, u32> = EntitySpec::new(
            EntityKey::new("sum", "a", 0),
            0,
            Tags::new("numbers"),
            |state, event| state + event,
        );
        let copy = spec.clone();
        assert!(Arc::ptr_eq(&spec.fold, &copy.fold));
        assert_eq!((copy.fold)(copy.initial_state, &5), 5);
    }
}
