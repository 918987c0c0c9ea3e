use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedEventState = Arc<RwLock<EventState>>;

/// In-memory entity store: resources, events, and the allocation index that
/// ties them together. All mutation goes through the engine; the store itself
/// only knows how to hold state and how to apply committed records to it.
pub struct Store {
    resources: DashMap<Ulid, SharedResourceState>,
    events: DashMap<Ulid, SharedEventState>,
    /// Reverse lookup: allocation id → resource id
    allocation_to_resource: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            events: DashMap::new(),
            allocation_to_resource: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, id: Ulid, state: SharedResourceState) {
        self.resources.insert(id, state);
    }

    pub fn remove_resource(&self, id: &Ulid) -> Option<(Ulid, SharedResourceState)> {
        self.resources.remove(id)
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    // ── Events ───────────────────────────────────────────────

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn get_event(&self, id: &Ulid) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn contains_event(&self, id: &Ulid) -> bool {
        self.events.contains_key(id)
    }

    pub fn insert_event(&self, id: Ulid, state: SharedEventState) {
        self.events.insert(id, state);
    }

    pub fn remove_event(&self, id: &Ulid) -> Option<(Ulid, SharedEventState)> {
        self.events.remove(id)
    }

    pub fn event_ids(&self) -> Vec<Ulid> {
        self.events.iter().map(|e| *e.key()).collect()
    }

    // ── Allocation index ─────────────────────────────────────

    pub fn get_resource_for_allocation(&self, allocation_id: &Ulid) -> Option<Ulid> {
        self.allocation_to_resource
            .get(allocation_id)
            .map(|e| *e.value())
    }

    pub fn map_allocation(&self, allocation_id: Ulid, resource_id: Ulid) {
        self.allocation_to_resource.insert(allocation_id, resource_id);
    }

    pub fn unmap_allocation(&self, allocation_id: &Ulid) {
        self.allocation_to_resource.remove(allocation_id);
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a replayed record. Only valid during WAL replay, when this store
    /// is the sole owner of every Arc: try_read/try_write always succeed
    /// instantly. Never use blocking_read/blocking_write here because replay
    /// may run inside an async context (lazy tenant creation).
    pub(super) fn replay_record(&self, record: &Record) {
        match record {
            Record::ResourceCreated { id, name, kind } => {
                let rs = ResourceState::new(*id, name.clone(), kind.clone());
                self.insert_resource(*id, Arc::new(RwLock::new(rs)));
            }
            Record::ResourceUpdated { id, name, kind } => {
                if let Some(rs) = self.get_resource(id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.name = name.clone();
                    guard.kind = kind.clone();
                }
            }
            Record::ResourceDeleted { id } => {
                self.remove_resource(id);
            }
            Record::EventScheduled {
                id,
                title,
                span,
                description,
            } => {
                let ev = EventState::new(*id, title.clone(), *span, description.clone());
                self.insert_event(*id, Arc::new(RwLock::new(ev)));
            }
            Record::EventRescheduled {
                id,
                title,
                span,
                description,
            } => {
                if let Some(ev) = self.get_event(id) {
                    let mut guard = ev.try_write().expect("replay: uncontended write");
                    guard.title = title.clone();
                    guard.span = *span;
                    guard.description = description.clone();
                    for (alloc_id, resource_id) in guard.allocations.clone() {
                        if let Some(rs) = self.get_resource(&resource_id) {
                            let mut rs_guard =
                                rs.try_write().expect("replay: uncontended write");
                            reschedule_slot(&mut rs_guard, alloc_id, *span);
                        }
                    }
                }
            }
            Record::EventDeleted { id } => {
                if let Some((_, ev)) = self.remove_event(id) {
                    let guard = ev.try_read().expect("replay: uncontended read");
                    for (alloc_id, resource_id) in &guard.allocations {
                        if let Some(rs) = self.get_resource(resource_id) {
                            let mut rs_guard =
                                rs.try_write().expect("replay: uncontended write");
                            rs_guard.remove_slot(*alloc_id);
                        }
                        self.unmap_allocation(alloc_id);
                    }
                }
            }
            Record::AllocationAdded {
                id,
                event_id,
                resource_id,
                span,
            } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.insert_slot(AllocationSlot {
                        id: *id,
                        event_id: *event_id,
                        span: *span,
                    });
                }
                if let Some(ev) = self.get_event(event_id) {
                    let mut guard = ev.try_write().expect("replay: uncontended write");
                    guard.allocations.push((*id, *resource_id));
                }
                self.map_allocation(*id, *resource_id);
            }
            Record::AllocationRemoved {
                id,
                event_id,
                resource_id,
            } => {
                if let Some(rs) = self.get_resource(resource_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.remove_slot(*id);
                }
                if let Some(ev) = self.get_event(event_id) {
                    let mut guard = ev.try_write().expect("replay: uncontended write");
                    guard.allocations.retain(|(aid, _)| aid != id);
                }
                self.unmap_allocation(id);
            }
        }
    }
}

/// Re-slot an allocation under a new window, keeping the slot list sorted.
/// No-op if the allocation isn't on this resource.
pub(super) fn reschedule_slot(rs: &mut ResourceState, allocation_id: Ulid, span: Span) {
    if let Some(slot) = rs.remove_slot(allocation_id) {
        rs.insert_slot(AllocationSlot { span, ..slot });
    }
}
