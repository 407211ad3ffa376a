//! Registry entry points: build registry entities and observe their members.
//!
//! A registry is an entity whose state is a [`MembershipSet`]. Observing a
//! registry through an [`ObservationSource`] and feeding the result into a
//! [`DynamicCollectionObserver`] yields the live states of every member.
//!
//! [`Registration`] bundles everything needed to register one kind of
//! entity, so callers can go straight to [`observe_all`].

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::event::{TypedEvent, Where};
use crate::membership::{
    EventTypes, ExtractIdentifier, MembershipDecision, MembershipFold, MembershipSet,
};
use crate::observer::DynamicCollectionObserver;
use crate::source::{EntityKey, EntitySpec, Identifier, Observation, ObservationSource};

/// Entity type of every registry entity built by this module.
pub const REGISTRY_ENTITY_TYPE: &str = "registry";

/// Builds the entity observed for one member.
pub type MakeEntity<S, X> = Arc<dyn Fn(&Identifier) -> EntitySpec<S, X> + Send + Sync>;

/// Build a type-list registry entity.
///
/// # Arguments
///
/// * `selector` - Events the registry folds.
/// * `extract_identifier` - Identifier an event refers to.
/// * `add` - Event types that add their identifier.
/// * `remove` - Event types that remove their identifier.
/// * `discriminant` - Distinguishes registries that differ only in
///   `extract_identifier`, which the identity cannot capture.
///
/// # Returns
///
/// An entity starting from the empty set, keyed
/// `registry/<selector>|<add>|<remove>|<discriminant>@0`.
///
/// # Examples
///
/// ```
/// use eventfold_registry::{Tags, TypedEvent, create_registry};
///
/// struct Ev { kind: String, id: String }
/// impl TypedEvent for Ev {
///     fn event_type(&self) -> &str { &self.kind }
/// }
///
/// let spec = create_registry(Tags::new("orders"), |e: &Ev| Some(e.id.clone()), "created", "deleted", None);
/// assert_eq!(spec.key.name, "'orders'|created|deleted|");
/// ```
pub fn create_registry<E, F>(
    selector: impl Into<Where>,
    extract_identifier: F,
    add: impl Into<EventTypes>,
    remove: impl Into<EventTypes>,
    discriminant: Option<&str>,
) -> EntitySpec<MembershipSet, E>
where
    E: TypedEvent + 'static,
    F: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
{
    let selector = selector.into();
    let add = add.into();
    let remove = remove.into();
    let name = format!("{selector}|{add}|{remove}|{}", discriminant.unwrap_or_default());
    MembershipFold::from_event_types(extract_identifier, add, remove)
        .into_spec(EntityKey::new(REGISTRY_ENTITY_TYPE, name, 0), selector)
}

/// Build a predicate registry entity.
///
/// `descriptor` names the registry; it must be unique among registries over
/// the same selector. Pass [`MembershipFold::add_all`]-style handlers
/// (`|_| MembershipDecision::Add`) for registries that never forget.
///
/// # Returns
///
/// An entity starting from the empty set, keyed
/// `registry/<descriptor>_<selector>@0`.
pub fn create_generic_registry<E, F, H>(
    descriptor: &str,
    selector: impl Into<Where>,
    extract_identifier: F,
    handler: H,
) -> EntitySpec<MembershipSet, E>
where
    E: 'static,
    F: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
    H: Fn(&E) -> MembershipDecision + Send + Sync + 'static,
{
    let selector = selector.into();
    MembershipFold::from_predicate(extract_identifier, handler)
        .into_spec(generic_key(descriptor, &selector), selector)
}

fn generic_key(descriptor: &str, selector: &Where) -> EntityKey {
    EntityKey::new(REGISTRY_ENTITY_TYPE, format!("{descriptor}_{selector}"), 0)
}

/// Observe the states of every member of a [`MembershipSet`] registry.
///
/// # Arguments
///
/// * `source` - Materializes the registry and each member.
/// * `registry` - The registry entity.
/// * `make_entity` - Entity to observe for a member identifier.
///
/// # Returns
///
/// Snapshots of every member's state, in membership order.
pub fn observe_registry<Src, E, S, X, M>(
    source: &Src,
    registry: EntitySpec<MembershipSet, E>,
    make_entity: M,
) -> Observation<Vec<S>>
where
    Src: ObservationSource + Clone + 'static,
    E: DeserializeOwned + Send + 'static,
    S: Clone + Send + Sync + 'static,
    X: DeserializeOwned + Send + 'static,
    M: Fn(&Identifier) -> EntitySpec<S, X> + Send + Sync + 'static,
{
    tracing::debug!(registry = %registry.key, "observing registry");
    let membership = source.observe(registry);
    let source = source.clone();
    DynamicCollectionObserver::new(move |id: &Identifier| Ok(source.observe(make_entity(id))))
        .observe(membership)
}

/// Observe the members of a registry with an arbitrary state shape.
///
/// `map_to_identifiers` turns registry state into member identifiers;
/// `None` slots are skipped.
pub fn observe_registry_map<Src, R, E, S, X, Map, M>(
    source: &Src,
    registry: EntitySpec<R, E>,
    map_to_identifiers: Map,
    make_entity: M,
) -> Observation<Vec<S>>
where
    Src: ObservationSource + Clone + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
    E: DeserializeOwned + Send + 'static,
    S: Clone + Send + Sync + 'static,
    X: DeserializeOwned + Send + 'static,
    Map: Fn(&R) -> Vec<Option<Identifier>> + Send + Sync + 'static,
    M: Fn(&Identifier) -> EntitySpec<S, X> + Send + Sync + 'static,
{
    tracing::debug!(registry = %registry.key, "observing mapped registry");
    let membership = source.observe(registry);
    let source = source.clone();
    DynamicCollectionObserver::with_mapping(map_to_identifiers, move |id: &Identifier| {
        Ok(source.observe(make_entity(id)))
    })
    .observe(membership)
}

/// Observe every registered entity, with membership decided by event type.
///
/// The registration's descriptor is used as the registry discriminant.
pub fn observe_all<Src, S, E, X>(
    source: &Src,
    registration: &Registration<S, E, X>,
    add: impl Into<EventTypes>,
    remove: impl Into<EventTypes>,
) -> Observation<Vec<S>>
where
    Src: ObservationSource + Clone + 'static,
    S: Clone + Send + Sync + 'static,
    E: TypedEvent + DeserializeOwned + Send + 'static,
    X: DeserializeOwned + Send + 'static,
{
    observe_registry(
        source,
        registration.registry(add, remove),
        shared_factory(registration.factory()),
    )
}

/// Observe every registered entity, with membership decided by `handler`.
pub fn observe_all_generic<Src, S, E, X, H>(
    source: &Src,
    registration: &Registration<S, E, X>,
    handler: H,
) -> Observation<Vec<S>>
where
    Src: ObservationSource + Clone + 'static,
    S: Clone + Send + Sync + 'static,
    E: DeserializeOwned + Send + 'static,
    X: DeserializeOwned + Send + 'static,
    H: Fn(&E) -> MembershipDecision + Send + Sync + 'static,
{
    observe_registry(
        source,
        registration.generic_registry(handler),
        shared_factory(registration.factory()),
    )
}

/// Everything needed to keep a registry of one kind of entity.
///
/// # Type Parameters
///
/// * `S` - Entity state.
/// * `E` - Event type the registry folds.
/// * `X` - Event type the entities fold. Defaults to `E`.
pub struct Registration<S, E, X = E> {
    descriptor: String,
    selector: Where,
    extract_identifier: ExtractIdentifier<E>,
    make_entity: MakeEntity<S, X>,
}

impl<S, E, X> Registration<S, E, X> {
    /// Describe a kind of entity.
    ///
    /// # Arguments
    ///
    /// * `descriptor` - Unique name for this kind; keeps different
    ///   registries over the same events apart.
    /// * `selector` - Events the registry folds.
    /// * `extract_identifier` - Identifier an event refers to.
    /// * `make_entity` - Entity for one identifier.
    pub fn new<F, M>(
        descriptor: impl Into<String>,
        selector: impl Into<Where>,
        extract_identifier: F,
        make_entity: M,
    ) -> Self
    where
        F: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
        M: Fn(&Identifier) -> EntitySpec<S, X> + Send + Sync + 'static,
    {
        Self {
            descriptor: descriptor.into(),
            selector: selector.into(),
            extract_identifier: Arc::new(extract_identifier),
            make_entity: Arc::new(make_entity),
        }
    }

    /// Name of this kind of entity, used in generic registry keys.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Events the registries of this registration fold.
    pub fn selector(&self) -> &Where {
        &self.selector
    }

    /// The entity for `id`.
    pub fn entity(&self, id: &Identifier) -> EntitySpec<S, X> {
        (self.make_entity)(id)
    }

    /// Type-list registry for this kind.
    pub fn registry(
        &self,
        add: impl Into<EventTypes>,
        remove: impl Into<EventTypes>,
    ) -> EntitySpec<MembershipSet, E>
    where
        E: TypedEvent + 'static,
    {
        create_registry(
            self.selector.clone(),
            shared_extractor(Arc::clone(&self.extract_identifier)),
            add,
            remove,
            Some(&self.descriptor),
        )
    }

    /// Predicate registry for this kind.
    pub fn generic_registry<H>(&self, handler: H) -> EntitySpec<MembershipSet, E>
    where
        E: 'static,
        H: Fn(&E) -> MembershipDecision + Send + Sync + 'static,
    {
        create_generic_registry(
            &self.descriptor,
            self.selector.clone(),
            shared_extractor(Arc::clone(&self.extract_identifier)),
            handler,
        )
    }

    /// Observe every registered entity with an already-built fold.
    ///
    /// The registry is keyed like [`create_generic_registry`]'s, so give
    /// registrations that use different folds different descriptors.
    pub fn observe_with<Src>(&self, source: &Src, fold: MembershipFold<E>) -> Observation<Vec<S>>
    where
        Src: ObservationSource + Clone + 'static,
        S: Clone + Send + Sync + 'static,
        E: DeserializeOwned + Send + 'static,
        X: DeserializeOwned + Send + 'static,
    {
        let key = generic_key(&self.descriptor, &self.selector);
        let registry = fold.into_spec(key, self.selector.clone());
        observe_registry(source, registry, shared_factory(self.factory()))
    }

    fn factory(&self) -> MakeEntity<S, X> {
        Arc::clone(&self.make_entity)
    }
}

// `Arc<dyn Fn>` is not itself `Fn`; these rewrap it as a closure.

fn shared_extractor<E: 'static>(
    extract: ExtractIdentifier<E>,
) -> impl Fn(&E) -> Option<Identifier> + Send + Sync + 'static {
    move |event: &E| extract(event)
}

fn shared_factory<S: 'static, X: 'static>(
    make_entity: MakeEntity<S, X>,
) -> impl Fn(&Identifier) -> EntitySpec<S, X> + Send + Sync + 'static {
    move |id: &Identifier| make_entity(id)
}

// Manual `Clone`: closures are shared, `S`/`E`/`X` need not be `Clone`.
impl<S, E, X> Clone for Registration<S, E, X> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            selector: self.selector.clone(),
            extract_identifier: Arc::clone(&self.extract_identifier),
            make_entity: Arc::clone(&self.make_entity),
        }
    }
}

impl<S, E, X> fmt::Debug for Registration<S, E, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("descriptor", &self.descriptor)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tags;
    use crate::membership::test_fixtures::TestEvent;

    fn extract(e: &TestEvent) -> Option<Identifier> {
        e.id.clone()
    }

    fn fold_all(spec: &EntitySpec<MembershipSet, TestEvent>, events: &[TestEvent]) -> MembershipSet {
        events
            .iter()
            .fold(spec.initial_state.clone(), |state, event| (spec.fold)(state, event))
    }

    fn registration() -> Registration<String, TestEvent> {
        Registration::new("test", Tags::new("test"), extract, |id: &Identifier| {
            EntitySpec::new(
                EntityKey::new("test-entity", id.clone(), 0),
                id.clone(),
                Tags::new("test").with_id(id),
                |state: String, _: &TestEvent| state,
            )
        })
    }

    #[test]
    fn type_list_registry_identity() {
        let spec = create_registry(Tags::new("test"), extract, "set", ["delete", "drop"], None);
        assert_eq!(spec.key.entity_type, REGISTRY_ENTITY_TYPE);
        assert_eq!(spec.key.name, "'test'|set|delete,drop|");
        assert_eq!(spec.key.version, 0);

        let discriminated = create_registry(Tags::new("test"), extract, "set", "delete", Some("by-owner"));
        assert_eq!(discriminated.key.name, "'test'|set|delete|by-owner");
    }

    #[test]
    fn equivalent_inputs_share_identity() {
        let single = create_registry(Tags::new("test"), extract, "set", EventTypes::none(), None);
        let list = create_registry(Tags::new("test"), extract, ["set"], Vec::<&str>::new(), None);
        assert_eq!(single.key, list.key);
    }

    #[test]
    fn type_list_registry_folds() {
        let spec = create_registry(Tags::new("test"), extract, "set", "delete", None);
        assert!(spec.initial_state.is_empty());
        assert!(spec.selector.matches(&Tags::new("test").with_id("foo")));

        let state = fold_all(
            &spec,
            &[TestEvent::new("set", "foo"), TestEvent::new("delete", "bar")],
        );
        assert_eq!(state.identifiers(), vec!["foo".to_string()]);
    }

    #[test]
    fn generic_registry_identity_and_fold() {
        let spec = create_generic_registry("reg", Tags::new("test"), extract, |e: &TestEvent| {
            match e.kind.as_str() {
                "forget" => MembershipDecision::Remove,
                "ignore" => MembershipDecision::Ignore,
                _ => MembershipDecision::Add,
            }
        });
        assert_eq!(spec.key.name, "reg_'test'");

        let state = fold_all(
            &spec,
            &[
                TestEvent::new("hello", "a"),
                TestEvent::new("ignore", "b"),
                TestEvent::new("hello", "c"),
                TestEvent::new("forget", "a"),
            ],
        );
        assert_eq!(state.identifiers(), vec!["c".to_string()]);
    }

    #[test]
    fn registration_builds_registries() {
        let registration = registration();
        assert_eq!(registration.descriptor(), "test");
        assert!(registration.selector().matches(&Tags::new("test").with_id("x")));

        let spec = registration.registry("set", "delete");
        assert_eq!(spec.key.name, "'test'|set|delete|test");

        let generic = registration.generic_registry(|_: &TestEvent| MembershipDecision::Add);
        assert_eq!(generic.key.name, "test_'test'");

        let entity = registration.entity(&"x".to_string());
        assert_eq!(entity.initial_state, "x");
        assert!(entity.selector.matches(&Tags::new("test").with_id("x")));
    }
}
