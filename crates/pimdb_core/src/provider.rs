//! Result providers: the sinks query results stream into.

use crate::entity::Entity;
use crate::key::{Identifier, Revision};
use std::collections::HashMap;

/// One change applied to a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A row was added.
    Added {
        /// Entity id.
        id: Identifier,
        /// Revision of the version that produced the event.
        revision: Revision,
    },
    /// A row was updated in place.
    Modified {
        /// Entity id.
        id: Identifier,
        /// Revision of the version that produced the event.
        revision: Revision,
    },
    /// A row left the result (removal or filter tombstone).
    Removed {
        /// Entity id.
        id: Identifier,
        /// Revision of the version that produced the event.
        revision: Revision,
    },
}

/// Contract between the query engine and a result consumer.
///
/// The initial phase only calls [`ResultProvider::add`]; the live
/// phase calls all three, in revision order for any one entity.
pub trait ResultProvider {
    /// A row entered the result.
    fn add(&mut self, entity: Entity);
    /// A row changed.
    fn modify(&mut self, entity: Entity);
    /// A row left the result.
    fn remove(&mut self, entity: Entity);
    /// Records the revision the result reflects.
    fn set_revision(&mut self, revision: Revision);
    /// The revision the result reflects.
    fn revision(&self) -> Revision;
    /// Marks the initial (or subtree) load as complete.
    fn set_children_fetched(&mut self, fetched: bool);
    /// Whether the initial load completed.
    fn children_fetched(&self) -> bool;
}

/// In-memory result model: ordered rows plus an event log.
///
/// Rows keep insertion order; modifications update in place, removals
/// drop the row. The event log is what tests and widgets consume.
#[derive(Debug, Default)]
pub struct ModelResult {
    order: Vec<Identifier>,
    rows: HashMap<Identifier, Entity>,
    revision: Revision,
    children_fetched: bool,
    events: Vec<ProviderEvent>,
}

impl ModelResult {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in the result.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.order.len()
    }

    /// Rows in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }

    /// The row at `index`, if any.
    #[must_use]
    pub fn entity_at(&self, index: usize) -> Option<&Entity> {
        self.order.get(index).and_then(|id| self.rows.get(id))
    }

    /// The row for `id`, if present.
    #[must_use]
    pub fn entity(&self, id: Identifier) -> Option<&Entity> {
        self.rows.get(&id)
    }

    /// Events accumulated since the last [`ModelResult::take_events`].
    #[must_use]
    pub fn events(&self) -> &[ProviderEvent] {
        &self.events
    }

    /// Drains the event log.
    pub fn take_events(&mut self) -> Vec<ProviderEvent> {
        std::mem::take(&mut self.events)
    }
}

impl ResultProvider for ModelResult {
    fn add(&mut self, entity: Entity) {
        let id = entity.id;
        let revision = entity.revision();
        if self.rows.insert(id, entity).is_none() {
            self.order.push(id);
        }
        self.events.push(ProviderEvent::Added { id, revision });
    }

    fn modify(&mut self, entity: Entity) {
        let id = entity.id;
        let revision = entity.revision();
        if self.rows.contains_key(&id) {
            self.rows.insert(id, entity);
            self.events.push(ProviderEvent::Modified { id, revision });
        } else {
            // A modification for a row the model never saw behaves
            // like an addition.
            self.add(entity);
        }
    }

    fn remove(&mut self, entity: Entity) {
        let id = entity.id;
        let revision = entity.revision();
        if self.rows.remove(&id).is_some() {
            self.order.retain(|existing| *existing != id);
            self.events.push(ProviderEvent::Removed { id, revision });
        }
    }

    fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    fn revision(&self) -> Revision {
        self.revision
    }

    fn set_children_fetched(&mut self, fetched: bool) {
        self.children_fetched = fetched;
    }

    fn children_fetched(&self) -> bool {
        self.children_fetched
    }
}
