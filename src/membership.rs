//! Membership fold: which identifiers a registry currently counts as active.
//!
//! A [`MembershipFold`] classifies each event as adding, removing, or not
//! touching the identifier the event refers to, and folds the decision into
//! a [`MembershipSet`]. The fold is total: events it cannot classify, or
//! whose identifier cannot be extracted, leave the set untouched.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::event::{TypedEvent, Where};
use crate::source::{EntityKey, EntitySpec, Identifier};

/// Set of member identifiers, kept in insertion order.
///
/// Represented as a map from identifier to `true`; removal deletes the key,
/// so no identifier ever maps to `false`. Serializes as a JSON object, e.g.
/// `{"foo": true}`. Entries mapped to `false` are dropped when deserializing.
///
/// Equality is structural and ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MembershipSet(IndexMap<Identifier, bool>);

impl<'de> Deserialize<'de> for MembershipSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = IndexMap::<Identifier, bool>::deserialize(deserializer)?;
        Ok(Self(
            entries.into_iter().filter(|(_, member)| *member).collect(),
        ))
    }
}

impl MembershipSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Identifier> {
        self.0.keys()
    }

    /// Members in insertion order, as owned identifiers.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.0.keys().cloned().collect()
    }

    /// Insert `id`. Already-present members keep their position.
    pub fn insert(&mut self, id: Identifier) {
        self.0.entry(id).or_insert(true);
    }

    /// Remove `id` if present, preserving the order of the other members.
    pub fn remove(&mut self, id: &str) {
        self.0.shift_remove(id);
    }
}

impl<I: Into<Identifier>> FromIterator<I> for MembershipSet {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id.into());
        }
        set
    }
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipDecision {
    /// The event's identifier becomes a member.
    Add,
    /// The event's identifier stops being a member.
    Remove,
    /// Membership is unchanged.
    Ignore,
}

/// Event-type tags for the type-list rule.
///
/// Accepts a single tag or a sequence of tags; duplicates collapse.
///
/// # Examples
///
/// ```
/// use eventfold_registry::EventTypes;
///
/// let one = EventTypes::from("created");
/// let many = EventTypes::from(["created", "restored", "created"]);
/// assert!(one.contains("created"));
/// assert_eq!(many.len(), 2);
/// assert!(EventTypes::none().is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypes(BTreeSet<String>);

impl EventTypes {
    /// No event types at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether `event_type` is in the set.
    pub fn contains(&self, event_type: &str) -> bool {
        self.0.contains(event_type)
    }

    /// Number of distinct types.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EventTypes {
    fn from(event_type: &str) -> Self {
        Self(BTreeSet::from([event_type.to_owned()]))
    }
}

impl From<String> for EventTypes {
    fn from(event_type: String) -> Self {
        Self(BTreeSet::from([event_type]))
    }
}

impl<const N: usize> From<[&str; N]> for EventTypes {
    fn from(event_types: [&str; N]) -> Self {
        event_types.into_iter().collect()
    }
}

impl From<&[&str]> for EventTypes {
    fn from(event_types: &[&str]) -> Self {
        event_types.iter().copied().collect()
    }
}

impl From<Vec<&str>> for EventTypes {
    fn from(event_types: Vec<&str>) -> Self {
        event_types.into_iter().collect()
    }
}

impl From<Vec<String>> for EventTypes {
    fn from(event_types: Vec<String>) -> Self {
        event_types.into_iter().collect()
    }
}

impl<T: Into<String>> FromIterator<T> for EventTypes {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for EventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.0.iter().map(String::as_str).collect();
        f.write_str(&joined.join(","))
    }
}

/// Extracts the identifier an event refers to. `None` means "no entity".
pub type ExtractIdentifier<E> = Arc<dyn Fn(&E) -> Option<Identifier> + Send + Sync>;

/// Classifies an event for the predicate rule.
pub type ClassifyFn<E> = Arc<dyn Fn(&E) -> MembershipDecision + Send + Sync>;

/// How a [`MembershipFold`] classifies events. Fixed at construction.
pub enum ClassificationRule<E> {
    /// Decide from the event's type tag.
    ///
    /// `add` is checked before `remove`; a tag in neither is ignored.
    TypeList {
        /// Tags that add the event's identifier.
        add: EventTypes,
        /// Tags that remove the event's identifier.
        remove: EventTypes,
        /// Reads the tag off an event.
        type_of: fn(&E) -> &str,
    },
    /// Decide with an arbitrary function, e.g. from the payload.
    Predicate(ClassifyFn<E>),
}

impl<E> ClassificationRule<E> {
    /// Type-list rule for events that expose their tag.
    pub fn type_list(add: impl Into<EventTypes>, remove: impl Into<EventTypes>) -> Self
    where
        E: TypedEvent,
    {
        Self::TypeList {
            add: add.into(),
            remove: remove.into(),
            type_of: <E as TypedEvent>::event_type,
        }
    }

    /// Predicate rule.
    pub fn predicate<F>(classify: F) -> Self
    where
        F: Fn(&E) -> MembershipDecision + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(classify))
    }

    /// Classify one event.
    pub fn classify(&self, event: &E) -> MembershipDecision {
        match self {
            Self::TypeList {
                add,
                remove,
                type_of,
            } => {
                let event_type = type_of(event);
                if add.contains(event_type) {
                    MembershipDecision::Add
                } else if remove.contains(event_type) {
                    MembershipDecision::Remove
                } else {
                    MembershipDecision::Ignore
                }
            }
            Self::Predicate(classify) => classify(event),
        }
    }
}

impl<E> Clone for ClassificationRule<E> {
    fn clone(&self) -> Self {
        match self {
            Self::TypeList {
                add,
                remove,
                type_of,
            } => Self::TypeList {
                add: add.clone(),
                remove: remove.clone(),
                type_of: *type_of,
            },
            Self::Predicate(classify) => Self::Predicate(Arc::clone(classify)),
        }
    }
}

impl<E> fmt::Debug for ClassificationRule<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeList { add, remove, .. } => f
                .debug_struct("TypeList")
                .field("add", add)
                .field("remove", remove)
                .finish_non_exhaustive(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Fold maintaining a [`MembershipSet`] from domain events.
///
/// # Examples
///
/// ```
/// use eventfold_registry::{MembershipFold, MembershipSet, TypedEvent};
///
/// struct Ev { kind: &'static str, id: &'static str }
/// impl TypedEvent for Ev {
///     fn event_type(&self) -> &str { self.kind }
/// }
///
/// let fold = MembershipFold::from_event_types(|e: &Ev| Some(e.id.to_string()), "set", "delete");
/// let state = fold.apply(MembershipSet::new(), &Ev { kind: "set", id: "foo" });
/// let state = fold.apply(state, &Ev { kind: "delete", id: "bar" });
/// assert_eq!(state.identifiers(), vec!["foo".to_string()]);
/// ```
pub struct MembershipFold<E> {
    extract_identifier: ExtractIdentifier<E>,
    rule: ClassificationRule<E>,
}

impl<E> MembershipFold<E> {
    /// Build a fold from an extractor and a classification rule.
    pub fn new<X>(extract_identifier: X, rule: ClassificationRule<E>) -> Self
    where
        X: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
    {
        Self {
            extract_identifier: Arc::new(extract_identifier),
            rule,
        }
    }

    /// Fold driven by event-type tags.
    pub fn from_event_types<X>(
        extract_identifier: X,
        add: impl Into<EventTypes>,
        remove: impl Into<EventTypes>,
    ) -> Self
    where
        E: TypedEvent,
        X: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
    {
        Self::new(extract_identifier, ClassificationRule::type_list(add, remove))
    }

    /// Fold driven by an explicit classification function.
    pub fn from_predicate<X, F>(extract_identifier: X, classify: F) -> Self
    where
        X: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
        F: Fn(&E) -> MembershipDecision + Send + Sync + 'static,
    {
        Self::new(extract_identifier, ClassificationRule::predicate(classify))
    }

    /// Fold that adds the identifier of every event and never removes.
    pub fn add_all<X>(extract_identifier: X) -> Self
    where
        X: Fn(&E) -> Option<Identifier> + Send + Sync + 'static,
    {
        Self::from_predicate(extract_identifier, |_| MembershipDecision::Add)
    }

    /// The configured rule.
    pub fn rule(&self) -> &ClassificationRule<E> {
        &self.rule
    }

    /// Classify one event without touching any state.
    pub fn classify(&self, event: &E) -> MembershipDecision {
        self.rule.classify(event)
    }

    /// Apply one event to `state`.
    ///
    /// `Ignore`d events and events without an identifier return `state` as
    /// it was. Adding a member twice, or removing a non-member, is a no-op.
    pub fn apply(&self, mut state: MembershipSet, event: &E) -> MembershipSet {
        let decision = self.classify(event);
        if decision == MembershipDecision::Ignore {
            return state;
        }

        // An empty string is a valid identifier; only `None` is skipped.
        let Some(id) = (self.extract_identifier)(event) else {
            return state;
        };

        match decision {
            MembershipDecision::Add => state.insert(id),
            MembershipDecision::Remove => state.remove(&id),
            MembershipDecision::Ignore => {}
        }
        state
    }

    /// Turn the fold into an entity a source can materialize.
    ///
    /// The entity starts from an empty set and folds every event selected by
    /// `selector`.
    pub fn into_spec(self, key: EntityKey, selector: impl Into<Where>) -> EntitySpec<MembershipSet, E>
    where
        E: 'static,
    {
        EntitySpec::new(key, MembershipSet::new(), selector, move |state, event: &E| {
            self.apply(state, event)
        })
    }
}

impl<E> Clone for MembershipFold<E> {
    fn clone(&self) -> Self {
        Self {
            extract_identifier: Arc::clone(&self.extract_identifier),
            rule: self.rule.clone(),
        }
    }
}

impl<E> fmt::Debug for MembershipFold<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipFold")
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::TestEvent;
    use super::*;

    fn type_list() -> MembershipFold<TestEvent> {
        MembershipFold::from_event_types(|e: &TestEvent| e.id.clone(), ["set"], ["delete"])
    }

    fn fold_all(fold: &MembershipFold<TestEvent>, events: &[TestEvent]) -> MembershipSet {
        events
            .iter()
            .fold(MembershipSet::new(), |state, event| fold.apply(state, event))
    }

    #[test]
    fn set_then_delete_unknown() {
        let state = fold_all(
            &type_list(),
            &[TestEvent::new("set", "foo"), TestEvent::new("delete", "bar")],
        );
        assert_eq!(state, MembershipSet::from_iter(["foo"]));
    }

    #[test]
    fn duplicate_adds_collapse() {
        let fold = type_list();
        let once = fold_all(&fold, &[TestEvent::new("set", "foo")]);
        let twice = fold_all(
            &fold,
            &[
                TestEvent::new("set", "foo"),
                TestEvent::new("set", "foo"),
                TestEvent::new("delete", "bar"),
            ],
        );
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn removing_absent_is_noop() {
        let fold = type_list();
        let state = MembershipSet::from_iter(["a"]);
        let after = fold.apply(state.clone(), &TestEvent::new("delete", "b"));
        assert_eq!(after, state);
    }

    #[test]
    fn unclassified_events_are_ignored() {
        let fold = type_list();
        let state = MembershipSet::from_iter(["a"]);
        assert_eq!(fold.classify(&TestEvent::new("rename", "a")), MembershipDecision::Ignore);
        let after = fold.apply(state.clone(), &TestEvent::new("rename", "b"));
        assert_eq!(after, state);
    }

    #[test]
    fn missing_identifier_never_changes_state() {
        let fold = type_list();
        let state = MembershipSet::from_iter(["a"]);
        assert_eq!(fold.apply(state.clone(), &TestEvent::anonymous("set")), state);
        assert_eq!(fold.apply(state.clone(), &TestEvent::anonymous("delete")), state);
    }

    #[test]
    fn order_matters() {
        let fold = type_list();
        let readded = fold_all(
            &fold,
            &[
                TestEvent::new("set", "a"),
                TestEvent::new("delete", "a"),
                TestEvent::new("set", "a"),
            ],
        );
        assert!(readded.contains("a"));

        let removed = fold_all(
            &fold,
            &[
                TestEvent::new("set", "a"),
                TestEvent::new("set", "a"),
                TestEvent::new("delete", "a"),
            ],
        );
        assert!(!removed.contains("a"));
    }

    #[test]
    fn add_types_win_over_remove_types() {
        let fold =
            MembershipFold::from_event_types(|e: &TestEvent| e.id.clone(), "toggle", "toggle");
        let state = fold.apply(MembershipSet::new(), &TestEvent::new("toggle", "a"));
        assert!(state.contains("a"));
    }

    #[test]
    fn single_tag_and_list_forms_agree() {
        let single = MembershipFold::from_event_types(|e: &TestEvent| e.id.clone(), "set", "delete");
        let list =
            MembershipFold::from_event_types(|e: &TestEvent| e.id.clone(), vec!["set"], vec!["delete"]);
        let events = [
            TestEvent::new("set", "a"),
            TestEvent::new("set", "b"),
            TestEvent::new("delete", "a"),
        ];
        assert_eq!(fold_all(&single, &events), fold_all(&list, &events));
    }

    #[test]
    fn empty_identifier_is_a_member() {
        let state = type_list().apply(MembershipSet::new(), &TestEvent::new("set", ""));
        assert!(state.contains(""));
    }

    #[test]
    fn predicate_rule_uses_payload() {
        // Only events that carry an identifier and are not "close" count.
        let fold = MembershipFold::from_predicate(
            |e: &TestEvent| e.id.clone(),
            |e: &TestEvent| match e.kind.as_str() {
                "close" => MembershipDecision::Remove,
                "noise" => MembershipDecision::Ignore,
                _ => MembershipDecision::Add,
            },
        );
        let state = fold_all(
            &fold,
            &[
                TestEvent::new("open", "a"),
                TestEvent::new("anything", "b"),
                TestEvent::new("noise", "c"),
                TestEvent::new("close", "a"),
            ],
        );
        assert_eq!(state.identifiers(), vec!["b".to_string()]);
    }

    #[test]
    fn add_all_never_removes() {
        let fold = MembershipFold::add_all(|e: &TestEvent| e.id.clone());
        let state = fold_all(
            &fold,
            &[TestEvent::new("set", "a"), TestEvent::new("delete", "a")],
        );
        assert!(state.contains("a"));
    }

    #[test]
    fn insertion_order_is_kept_across_removal() {
        let fold = type_list();
        let state = fold_all(
            &fold,
            &[
                TestEvent::new("set", "c"),
                TestEvent::new("set", "a"),
                TestEvent::new("set", "b"),
                TestEvent::new("delete", "a"),
                TestEvent::new("set", "c"),
            ],
        );
        assert_eq!(state.identifiers(), vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn equality_ignores_order() {
        assert_eq!(
            MembershipSet::from_iter(["a", "b"]),
            MembershipSet::from_iter(["b", "a"])
        );
    }

    #[test]
    fn serializes_as_object_of_true() {
        let state = MembershipSet::from_iter(["foo"]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({ "foo": true }));
    }

    #[test]
    fn deserializing_drops_false_entries() {
        let state: MembershipSet =
            serde_json::from_value(serde_json::json!({ "a": false, "b": true, "c": false }))
                .unwrap();
        assert!(!state.contains("a"));
        assert!(state.contains("b"));
        assert_eq!(state.len(), 1);
        assert_eq!(state.identifiers(), vec!["b".to_owned()]);
        assert_eq!(state, MembershipSet::from_iter(["b"]));
    }

    #[test]
    fn into_spec_folds_with_rule() {
        let spec = type_list().into_spec(
            EntityKey::new("registry", "test", 0),
            crate::event::Tags::new("test"),
        );
        assert!(spec.initial_state.is_empty());
        let state = (spec.fold)(spec.initial_state.clone(), &TestEvent::new("set", "x"));
        assert!(state.contains("x"));
    }
}
