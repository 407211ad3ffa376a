//! Event selectors and the stored event record.
//!
//! Events are addressed by tags. An entity declares which events it folds
//! through a [`Where`] selector; an event is delivered to it when the tags
//! the event was emitted with satisfy the selector.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A set of string tags attached to an event, or required by a selector.
///
/// As a selector, `Tags` is a conjunction: an event matches when it carries
/// every tag in the set. An empty set matches every event.
///
/// # Examples
///
/// ```
/// use eventfold_registry::Tags;
///
/// let room = Tags::new("chat").with_id("lobby");
/// assert!(room.contains("chat"));
/// assert!(room.contains("chat:lobby"));
/// assert!(Tags::new("chat").is_subset_of(&room));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    /// A selector consisting of a single tag.
    pub fn new(tag: impl Into<String>) -> Self {
        let mut set = BTreeSet::new();
        set.insert(tag.into());
        Self(set)
    }

    /// The empty tag set. Matches every event when used as a selector.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Conjunction of `self` and `other`.
    pub fn and(mut self, other: Tags) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Add an identifying tag `"<tag>:<id>"` for every tag already present.
    ///
    /// The plain tags are kept, so `Tags::new("chat").with_id("a")` carries
    /// both `chat` and `chat:a`.
    pub fn with_id(mut self, id: &str) -> Self {
        let scoped: Vec<String> = self.0.iter().map(|tag| format!("{tag}:{id}")).collect();
        self.0.extend(scoped);
        self
    }

    /// Whether the set contains `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// Whether every tag of `self` is also carried by `other`.
    pub fn is_subset_of(&self, other: &Tags) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Iterate over the tags in lexical order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.0 {
            if !first {
                f.write_str(" & ")?;
            }
            write!(f, "'{tag}'")?;
            first = false;
        }
        Ok(())
    }
}

/// Event selector: a disjunction of [`Tags`] conjunctions.
///
/// Build one from `Tags` and widen it with [`Where::or`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Where {
    any_of: Vec<Tags>,
}

impl Where {
    /// Also match events selected by `other`.
    pub fn or(mut self, other: impl Into<Where>) -> Self {
        for tags in other.into().any_of {
            if !self.any_of.contains(&tags) {
                self.any_of.push(tags);
            }
        }
        self
    }

    /// Whether an event emitted with `tags` is selected.
    pub fn matches(&self, tags: &Tags) -> bool {
        self.any_of.iter().any(|required| required.is_subset_of(tags))
    }
}

impl From<Tags> for Where {
    fn from(tags: Tags) -> Self {
        Self {
            any_of: vec![tags],
        }
    }
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tags) in self.any_of.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{tags}")?;
        }
        Ok(())
    }
}

/// An event as kept in an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Zero-based position in the log.
    pub offset: u64,
    /// Tags the event was emitted with.
    pub tags: Tags,
    /// JSON-encoded domain payload.
    pub payload: serde_json::Value,
}

/// Domain events that expose a type tag.
///
/// Required by the type-list classification rule, which decides membership
/// from the event's tag alone.
///
/// # Examples
///
/// ```
/// use eventfold_registry::TypedEvent;
///
/// enum RoomEvent {
///     Opened { room: String },
///     Closed { room: String },
/// }
///
/// impl TypedEvent for RoomEvent {
///     fn event_type(&self) -> &str {
///         match self {
///             RoomEvent::Opened { .. } => "opened",
///             RoomEvent::Closed { .. } => "closed",
///         }
///     }
/// }
/// ```
pub trait TypedEvent {
    /// The event's type tag, e.g. `"created"`.
    fn event_type(&self) -> &str;
}
