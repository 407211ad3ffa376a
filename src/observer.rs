//! Dynamic re-subscription: one live snapshot over a changing member set.
//!
//! [`DynamicCollectionObserver`] turns an observation of registry state into
//! an observation of `Vec<S>`, the latest state of every current member in
//! member order. Each distinct registry state starts a new *generation*:
//! the previous generation's entity observations are dropped, then one
//! observation per member is created through the entity factory. A
//! generation emits once every member has produced a state, and again each
//! time any member produces a new one.
//!
//! The work happens inside [`RegistryStream::poll_next`]: no task is spawned
//! and nothing is shared, so dropping the returned observation cancels the
//! registry observation and every entity observation with it.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use crate::error::ObserveError;
use crate::membership::MembershipSet;
use crate::source::{Identifier, Observation};

/// Maps registry state to the ordered member identifiers.
///
/// `None` slots are dropped before use.
pub type IdentifierMap<R> = Arc<dyn Fn(&R) -> Vec<Option<Identifier>> + Send + Sync>;

/// Creates the live observation of one member.
pub type EntityFactory<S> =
    Arc<dyn Fn(&Identifier) -> Result<Observation<S>, ObserveError> + Send + Sync>;

/// Tuning for [`DynamicCollectionObserver`].
///
/// # Examples
///
/// ```
/// use eventfold_registry::ObserverConfig;
///
/// let config = ObserverConfig {
///     reuse_observations: true,
/// };
/// assert!(!ObserverConfig::default().reuse_observations);
/// # let _ = config;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ObserverConfig {
    /// Carry entity observations of identifiers that stay members over to
    /// the next generation instead of creating them again.
    ///
    /// Observations of identifiers that left are still dropped before the
    /// factory runs for newcomers.
    ///
    /// Default: `false` (every generation starts from fresh observations).
    pub reuse_observations: bool,
}

/// Builds aggregate observations from a registry observation.
///
/// # Type Parameters
///
/// * `R` - Registry state, compared structurally to skip repeated states.
/// * `S` - Entity state.
pub struct DynamicCollectionObserver<R, S> {
    map_to_identifiers: IdentifierMap<R>,
    make_entity: EntityFactory<S>,
    config: ObserverConfig,
}

impl<S> DynamicCollectionObserver<MembershipSet, S> {
    /// Observer for registries whose state is a [`MembershipSet`].
    pub fn new<F>(make_entity: F) -> Self
    where
        F: Fn(&Identifier) -> Result<Observation<S>, ObserveError> + Send + Sync + 'static,
    {
        Self::with_mapping(
            |state: &MembershipSet| state.iter().cloned().map(Some).collect(),
            make_entity,
        )
    }
}

impl<R, S> DynamicCollectionObserver<R, S> {
    /// Observer for any registry state, mapped to identifiers by
    /// `map_to_identifiers`.
    pub fn with_mapping<M, F>(map_to_identifiers: M, make_entity: F) -> Self
    where
        M: Fn(&R) -> Vec<Option<Identifier>> + Send + Sync + 'static,
        F: Fn(&Identifier) -> Result<Observation<S>, ObserveError> + Send + Sync + 'static,
    {
        Self {
            map_to_identifiers: Arc::new(map_to_identifiers),
            make_entity: Arc::new(make_entity),
            config: ObserverConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe the members of `membership`.
    ///
    /// The returned observation yields `Vec<S>` snapshots ordered as the
    /// identifiers. An empty member list yields `[]` without calling the
    /// factory. The first error from any source is yielded once and ends the
    /// observation.
    pub fn observe(&self, membership: Observation<R>) -> Observation<Vec<S>>
    where
        R: PartialEq + Send + 'static,
        S: Clone + Send + 'static,
    {
        Box::pin(RegistryStream {
            membership: Some(membership),
            last_membership: None,
            map_to_identifiers: Arc::clone(&self.map_to_identifiers),
            make_entity: Arc::clone(&self.make_entity),
            reuse_observations: self.config.reuse_observations,
            generation: Generation::Idle,
            terminated: false,
        })
    }
}

impl<R, S> Clone for DynamicCollectionObserver<R, S> {
    fn clone(&self) -> Self {
        Self {
            map_to_identifiers: Arc::clone(&self.map_to_identifiers),
            make_entity: Arc::clone(&self.make_entity),
            config: self.config.clone(),
        }
    }
}

impl<R, S> fmt::Debug for DynamicCollectionObserver<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCollectionObserver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One live entity observation and the last state it produced.
struct Member<S> {
    id: Identifier,
    observation: Observation<S>,
    latest: Option<S>,
    finished: bool,
}

/// The entity observations belonging to one registry state.
enum Generation<S> {
    /// No registry state seen yet.
    Idle,
    /// The registry is empty; `[]` is owed until `emitted`.
    Empty { emitted: bool },
    Live {
        members: Vec<Member<S>>,
        /// Where the next polling round starts, so busy members cannot
        /// starve the others.
        cursor: usize,
        /// A snapshot is owed as soon as every member has a state.
        dirty: bool,
    },
}

impl<S: Clone> Generation<S> {
    fn snapshot(members: &[Member<S>]) -> Option<Vec<S>> {
        members.iter().map(|m| m.latest.clone()).collect()
    }

    /// Whether this generation can never emit again.
    fn is_exhausted(&self) -> bool {
        match self {
            Self::Idle => true,
            Self::Empty { emitted } => *emitted,
            Self::Live { members, .. } => {
                members.iter().all(|m| m.finished)
                    || members.iter().any(|m| m.finished && m.latest.is_none())
            }
        }
    }

    /// Poll the members for the next snapshot.
    ///
    /// Polls each unfinished member at most once per call. Returns `Pending`
    /// when no snapshot is ready, waking itself first if some member made
    /// progress.
    fn poll_snapshot(&mut self, cx: &mut Context<'_>) -> Poll<Result<Vec<S>, ObserveError>> {
        match self {
            Self::Idle => Poll::Pending,
            Self::Empty { emitted } => {
                if *emitted {
                    Poll::Pending
                } else {
                    *emitted = true;
                    Poll::Ready(Ok(Vec::new()))
                }
            }
            Self::Live {
                members,
                cursor,
                dirty,
            } => {
                // One round per call, so membership gets polled between rounds.
                let count = members.len();
                let mut progressed = false;
                for step in 0..count {
                    let index = (*cursor + step) % count;
                    let Some(member) = members.get_mut(index) else {
                        continue;
                    };
                    if member.finished {
                        continue;
                    }
                    match member.observation.as_mut().poll_next(cx) {
                        Poll::Ready(Some(Ok(state))) => {
                            member.latest = Some(state);
                            progressed = true;
                            if let Some(snapshot) = Self::snapshot(members) {
                                *cursor = (index + 1) % count;
                                *dirty = false;
                                return Poll::Ready(Ok(snapshot));
                            }
                        }
                        Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                        Poll::Ready(None) => {
                            tracing::trace!(entity = %member.id, "entity observation completed");
                            member.finished = true;
                        }
                        Poll::Pending => {}
                    }
                }

                if *dirty && let Some(snapshot) = Self::snapshot(members) {
                    *dirty = false;
                    return Poll::Ready(Ok(snapshot));
                }
                if progressed {
                    // A ready member registered no waker.
                    cx.waker().wake_by_ref();
                }
                Poll::Pending
            }
        }
    }

    fn into_members(self) -> Vec<Member<S>> {
        match self {
            Self::Live { members, .. } => members,
            Self::Idle | Self::Empty { .. } => Vec::new(),
        }
    }
}

/// The aggregate observation returned by
/// [`DynamicCollectionObserver::observe`].
pub struct RegistryStream<R, S> {
    membership: Option<Observation<R>>,
    last_membership: Option<R>,
    map_to_identifiers: IdentifierMap<R>,
    make_entity: EntityFactory<S>,
    reuse_observations: bool,
    generation: Generation<S>,
    terminated: bool,
}

// No field is structurally pinned: observations are boxed.
impl<R, S> Unpin for RegistryStream<R, S> {}

impl<R, S: Clone> RegistryStream<R, S> {
    /// Replace the current generation with one for `state`.
    ///
    /// The old generation's observations are dropped before the factory is
    /// called for the new one.
    fn switch_to(&mut self, state: &R) -> Result<(), ObserveError> {
        let ids: Vec<Identifier> = (self.map_to_identifiers)(state)
            .into_iter()
            .flatten()
            .collect();

        let previous = std::mem::replace(&mut self.generation, Generation::Idle);

        if ids.is_empty() {
            drop(previous);
            tracing::debug!("registry empty");
            self.generation = Generation::Empty { emitted: false };
            return Ok(());
        }

        let carried: Vec<Option<Member<S>>> = if self.reuse_observations {
            let mut reusable: HashMap<Identifier, Member<S>> = previous
                .into_members()
                .into_iter()
                .filter(|m| !m.finished)
                .map(|m| (m.id.clone(), m))
                .collect();
            // Whatever is left in `reusable` left the registry and is dropped
            // here, before any new observation exists.
            ids.iter().map(|id| reusable.remove(id)).collect()
        } else {
            drop(previous);
            ids.iter().map(|_| None).collect()
        };

        let mut members = Vec::with_capacity(ids.len());
        let mut created = 0usize;
        for (id, slot) in ids.into_iter().zip(carried) {
            match slot {
                Some(member) => members.push(member),
                None => {
                    let observation = (self.make_entity)(&id)?;
                    created += 1;
                    members.push(Member {
                        id,
                        observation,
                        latest: None,
                        finished: false,
                    });
                }
            }
        }

        tracing::debug!(
            members = members.len(),
            created,
            "registry changed, resubscribed entities"
        );
        self.generation = Generation::Live {
            members,
            cursor: 0,
            dirty: true,
        };
        Ok(())
    }

    /// End the stream with `err`, dropping every observation.
    fn fail(&mut self, err: ObserveError) -> Poll<Option<Result<Vec<S>, ObserveError>>> {
        tracing::debug!(error = %err, "registry observation failed");
        self.terminated = true;
        self.membership = None;
        self.generation = Generation::Idle;
        Poll::Ready(Some(Err(err)))
    }
}

impl<R, S> Stream for RegistryStream<R, S>
where
    R: PartialEq,
    S: Clone,
{
    type Item = Result<Vec<S>, ObserveError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }

        loop {
            // Membership first: a pending change supersedes entity updates of
            // the generation it replaces.
            let mut switched = false;
            if let Some(membership) = this.membership.as_mut() {
                match membership.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(state))) => {
                        if this.last_membership.as_ref() == Some(&state) {
                            tracing::trace!("registry state unchanged");
                            continue;
                        }
                        if let Err(err) = this.switch_to(&state) {
                            return this.fail(err);
                        }
                        this.last_membership = Some(state);
                        switched = true;
                    }
                    Poll::Ready(Some(Err(err))) => return this.fail(err),
                    Poll::Ready(None) => {
                        tracing::debug!("registry observation completed");
                        this.membership = None;
                    }
                    Poll::Pending => {}
                }
            }

            match this.generation.poll_snapshot(cx) {
                Poll::Ready(Ok(snapshot)) => return Poll::Ready(Some(Ok(snapshot))),
                Poll::Ready(Err(err)) => return this.fail(err),
                Poll::Pending => {}
            }

            // A fresh generation may be replaced right away if the registry
            // already has a newer state.
            if switched {
                continue;
            }

            if this.membership.is_none() && this.generation.is_exhausted() {
                this.terminated = true;
                this.generation = Generation::Idle;
                return Poll::Ready(None);
            }
            return Poll::Pending;
        }
    }
}

impl<R, S> fmt::Debug for RegistryStream<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = match &self.generation {
            Generation::Live { members, .. } => members.len(),
            Generation::Idle | Generation::Empty { .. } => 0,
        };
        f.debug_struct("RegistryStream")
            .field("members", &members)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
