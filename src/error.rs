//! Crate-level error types for observing registries and emitting events.

use crate::source::Identifier;

/// Error carried by an [`Observation`](crate::Observation) stream.
///
/// Any error yielded by the membership observation, the entity factory, or
/// one of the per-entity observations ends the aggregate stream: the error
/// is yielded once and the stream completes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserveError {
    /// An entity observation could not be created or failed while running.
    ///
    /// Produced by entity factories and observation sources to identify
    /// which member of a registry broke the aggregate.
    #[error("entity `{identifier}` could not be observed: {reason}")]
    Entity {
        /// The identifier whose observation failed.
        identifier: Identifier,
        /// Human-readable cause.
        reason: String,
    },

    /// The observation source shut down while the observation was live.
    ///
    /// Never produced by [`MemoryStore`](crate::MemoryStore), whose
    /// observations live as long as they are polled. Hosts whose sources can
    /// close (a dropped connection, a stopped server) yield this as the last
    /// item of every affected observation.
    #[error("observation source is no longer available")]
    SourceGone,

    /// A lock guarding the event log was poisoned by a panicking writer.
    #[error("event log lock poisoned")]
    Poisoned,

    /// A background subscription task ended abnormally.
    #[error("registry subscription task failed: {0}")]
    TaskFailed(String),
}

impl ObserveError {
    /// Shorthand for [`ObserveError::Entity`].
    pub fn entity(identifier: impl Into<Identifier>, reason: impl Into<String>) -> Self {
        Self::Entity {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }
}

/// Error returned when appending an event to an observation source fails.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The payload could not be encoded as JSON.
    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A lock guarding the event log was poisoned by a panicking writer.
    #[error("event log lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_error_names_identifier() {
        let err = ObserveError::entity("room-1", "boom");
        assert_eq!(err.to_string(), "entity `room-1` could not be observed: boom");
    }

    #[test]
    fn source_gone_display() {
        assert_eq!(
            ObserveError::SourceGone.to_string(),
            "observation source is no longer available"
        );
    }

    #[test]
    fn emit_error_from_serde() {
        // A map with non-string keys cannot be encoded as a JSON object.
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], 1u8);
        let json_err = serde_json::to_value(&map).unwrap_err();
        let err = EmitError::from(json_err);
        assert!(err.to_string().starts_with("failed to encode event payload"));
    }

    // Errors travel through `Send` streams and tokio tasks.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ObserveError>();
            assert_send_sync::<EmitError>();
        }
    };
}
