//! Live registries of event-sourced entities.
//!
//! A registry folds domain events into the set of entity identifiers that are
//! currently active ([`MembershipFold`]). Observing that set and re-subscribing
//! to every member whenever it changes ([`DynamicCollectionObserver`]) yields a
//! single live collection of all member states.
//!
//! Hosts plug in through [`ObservationSource`]; [`MemoryStore`] is an
//! in-process implementation.
//!
//! # Examples
//!
//! ```
//! use eventfold_registry::{
//!     EntityKey, EntitySpec, MemoryStore, ObservationSource, Tags, TypedEvent, create_registry,
//!     observe_registry,
//! };
//! use serde::{Deserialize, Serialize};
//! use tokio_stream::StreamExt;
//!
//! #[derive(Serialize, Deserialize)]
//! struct RoomEvent {
//!     #[serde(rename = "type")]
//!     kind: String,
//!     room: String,
//! }
//!
//! impl TypedEvent for RoomEvent {
//!     fn event_type(&self) -> &str {
//!         &self.kind
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! let opened = RoomEvent { kind: "opened".into(), room: "lobby".into() };
//! store.emit(Tags::new("room").with_id("lobby"), &opened).unwrap();
//!
//! let registry = create_registry(
//!     Tags::new("room"),
//!     |e: &RoomEvent| Some(e.room.clone()),
//!     "opened",
//!     "closed",
//!     None,
//! );
//! let mut rooms = observe_registry(&store, registry, |id| {
//!     EntitySpec::new(
//!         EntityKey::new("room-events", id.clone(), 0),
//!         0usize,
//!         Tags::new("room").with_id(id),
//!         |count, _: &RoomEvent| count + 1,
//!     )
//! });
//!
//! assert_eq!(rooms.next().await, Some(Ok(vec![1])));
//! # }
//! ```

mod error;
mod event;
pub mod live;
mod membership;
mod observer;
mod registry;
mod source;
mod store;

pub use error::{EmitError, ObserveError};
pub use event::{StoredEvent, Tags, TypedEvent, Where};
pub use live::{LiveHandle, subscribe};
pub use membership::{
    ClassificationRule, ClassifyFn, EventTypes, ExtractIdentifier, MembershipDecision,
    MembershipFold, MembershipSet,
};
pub use observer::{
    DynamicCollectionObserver, EntityFactory, IdentifierMap, ObserverConfig, RegistryStream,
};
pub use registry::{
    MakeEntity, REGISTRY_ENTITY_TYPE, Registration, create_generic_registry, create_registry,
    observe_all, observe_all_generic, observe_registry, observe_registry_map,
};
pub use source::{EntityKey, EntitySpec, FoldFn, Identifier, Observation, ObservationSource};
pub use store::MemoryStore;
