use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, now_ms, validate_not_past, validate_window};
use super::store::reschedule_slot;
use super::{Engine, EngineError};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::Validation("title must not be empty"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

fn validate_description(description: &Option<String>) -> Result<(), EngineError> {
    if let Some(d) = description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

/// True when `rs` still carries slot `id` and it belongs to `event_id`.
pub(super) fn slot_owned_by(rs: &ResourceState, id: Ulid, event_id: Ulid) -> bool {
    rs.slots
        .iter()
        .find(|s| s.id == id)
        .is_some_and(|s| s.event_id == event_id)
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_name(&name)?;
        if kind.len() > MAX_KIND_LEN {
            return Err(EngineError::LimitExceeded("kind too long"));
        }
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        self.persist_one(Record::ResourceCreated {
            id,
            name: name.clone(),
            kind: kind.clone(),
        })
        .await?;
        let rs = ResourceState::new(id, name, kind);
        self.store.insert_resource(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        validate_name(&name)?;
        if kind.len() > MAX_KIND_LEN {
            return Err(EngineError::LimitExceeded("kind too long"));
        }
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        self.persist_one(Record::ResourceUpdated {
            id,
            name: name.clone(),
            kind: kind.clone(),
        })
        .await?;
        guard.name = name;
        guard.kind = kind;
        Ok(())
    }

    /// Delete a resource. Refused while any event still holds it — the
    /// allocations must be removed (or their events deleted) first.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(id))?;
        // Hold the write guard across the removal so no allocation can land
        // between the emptiness check and the map removal.
        let guard = rs.write().await;
        if !guard.slots.is_empty() {
            return Err(EngineError::ResourceInUse(id));
        }

        self.persist_one(Record::ResourceDeleted { id }).await?;
        self.store.remove_resource(&id);
        drop(guard);
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────

    /// Schedule a new event, atomically allocating every requested resource.
    /// All-or-nothing: if any resource is busy in the window, nothing is
    /// committed and the full conflict list comes back as the error.
    pub async fn schedule_event(
        &self,
        id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
        resource_ids: Vec<Ulid>,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.store.event_count() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        validate_title(&title)?;
        validate_description(&description)?;
        if resource_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let span = validate_window(start, end)?;
        validate_not_past(&span, now_ms())?;

        let mut seen = HashSet::new();
        for rid in &resource_ids {
            if !seen.insert(*rid) {
                return Err(EngineError::DuplicateAllocation {
                    resource_id: *rid,
                    event_id: id,
                });
            }
        }
        if self.store.contains_event(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut sorted_ids = resource_ids.clone();
        sorted_ids.sort();

        let mut guards = Vec::with_capacity(sorted_ids.len());
        let mut rs_map = HashMap::new();
        for rid in &sorted_ids {
            let rs = self
                .store
                .get_resource(rid)
                .ok_or(EngineError::NotFound(*rid))?;
            let guard = rs.write_owned().await;
            if guard.slots.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many allocations on resource"));
            }
            rs_map.insert(*rid, guards.len());
            guards.push(guard);
        }

        // Phase 1: every resource must be free in the window.
        let mut pending = Vec::new();
        for rid in &resource_ids {
            let guard = &guards[rs_map[rid]];
            if let Some(slot) = find_conflict(guard, &span, None) {
                pending.push((*rid, guard.name.clone(), slot.event_id));
            }
        }
        if !pending.is_empty() {
            drop(guards);
            let conflicts = self.resolve_conflict_titles(pending).await;
            return Err(EngineError::Conflict(conflicts));
        }

        // Phase 2: all clear — one WAL transaction for the event and all of
        // its allocations.
        let allocations: Vec<(Ulid, Ulid)> =
            resource_ids.iter().map(|rid| (Ulid::new(), *rid)).collect();
        let mut records = vec![Record::EventScheduled {
            id,
            title: title.clone(),
            span,
            description: description.clone(),
        }];
        for (alloc_id, rid) in &allocations {
            records.push(Record::AllocationAdded {
                id: *alloc_id,
                event_id: id,
                resource_id: *rid,
                span,
            });
        }
        self.persist(records).await?;

        for (alloc_id, rid) in &allocations {
            guards[rs_map[rid]].insert_slot(AllocationSlot {
                id: *alloc_id,
                event_id: id,
                span,
            });
            self.store.map_allocation(*alloc_id, *rid);
        }
        let mut ev = EventState::new(id, title, span, description);
        ev.allocations = allocations;
        self.store.insert_event(id, Arc::new(RwLock::new(ev)));
        Ok(())
    }

    /// Allocate more resources to an existing event. Partial success: free
    /// resources are committed, busy ones are reported as conflicts, and
    /// resources the event already holds are reported as duplicates.
    pub async fn add_allocations(
        &self,
        event_id: Ulid,
        resource_ids: Vec<Ulid>,
    ) -> Result<AllocationReport, EngineError> {
        let _commit = self.commit_gate.read().await;
        if resource_ids.is_empty() {
            return Err(EngineError::Validation("no resources selected"));
        }
        if resource_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let ev = self
            .store
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        // Event lock before resource locks, always.
        let mut ev_guard = ev.write_owned().await;
        validate_not_past(&ev_guard.span, now_ms())?;
        let span = ev_guard.span;

        let mut report = AllocationReport::default();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for rid in resource_ids {
            if !seen.insert(rid) || ev_guard.holds_resource(rid) {
                report.duplicates.push(rid);
            } else {
                candidates.push(rid);
            }
        }

        let mut sorted_ids = candidates.clone();
        sorted_ids.sort();
        let mut guards = Vec::with_capacity(sorted_ids.len());
        let mut rs_map = HashMap::new();
        for rid in &sorted_ids {
            let rs = self
                .store
                .get_resource(rid)
                .ok_or(EngineError::NotFound(*rid))?;
            let guard = rs.write_owned().await;
            if guard.slots.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many allocations on resource"));
            }
            rs_map.insert(*rid, guards.len());
            guards.push(guard);
        }

        let mut pending_conflicts = Vec::new();
        let mut pending_adds = Vec::new();
        for rid in &candidates {
            let guard = &guards[rs_map[rid]];
            match find_conflict(guard, &span, Some(event_id)) {
                Some(slot) => pending_conflicts.push((*rid, guard.name.clone(), slot.event_id)),
                None => pending_adds.push((Ulid::new(), *rid)),
            }
        }

        if !pending_adds.is_empty() {
            let records: Vec<Record> = pending_adds
                .iter()
                .map(|(alloc_id, rid)| Record::AllocationAdded {
                    id: *alloc_id,
                    event_id,
                    resource_id: *rid,
                    span,
                })
                .collect();
            self.persist(records).await?;

            for (alloc_id, rid) in &pending_adds {
                guards[rs_map[rid]].insert_slot(AllocationSlot {
                    id: *alloc_id,
                    event_id,
                    span,
                });
                ev_guard.allocations.push((*alloc_id, *rid));
                self.store.map_allocation(*alloc_id, *rid);
            }
        }
        report.added = pending_adds;

        drop(guards);
        drop(ev_guard);
        report.conflicts = self.resolve_conflict_titles(pending_conflicts).await;
        Ok(report)
    }

    /// Edit an event. When the window moves, every existing allocation is
    /// re-validated against the new window (the event's own slots excluded);
    /// any conflict aborts the whole edit.
    pub async fn update_event(
        &self,
        id: Ulid,
        title: Option<String>,
        window: Option<(Ms, Ms)>,
        description: Option<Option<String>>,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        if let Some(ref t) = title {
            validate_title(t)?;
        }
        if let Some(ref d) = description {
            validate_description(d)?;
        }
        let ev = self
            .store
            .get_event(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut ev_guard = ev.write_owned().await;

        let new_span = match window {
            Some((start, end)) => {
                let span = validate_window(start, end)?;
                validate_not_past(&span, now_ms())?;
                Some(span)
            }
            None => None,
        };

        let final_title = title.unwrap_or_else(|| ev_guard.title.clone());
        let final_description = description.unwrap_or_else(|| ev_guard.description.clone());
        let final_span = new_span.unwrap_or(ev_guard.span);

        if let Some(span) = new_span {
            let mut rids: Vec<Ulid> = ev_guard.allocations.iter().map(|(_, rid)| *rid).collect();
            rids.sort();
            rids.dedup();

            let mut guards = Vec::with_capacity(rids.len());
            let mut rs_map = HashMap::new();
            for rid in &rids {
                let rs = self
                    .store
                    .get_resource(rid)
                    .ok_or(EngineError::NotFound(*rid))?;
                rs_map.insert(*rid, guards.len());
                guards.push(rs.write_owned().await);
            }

            let mut pending = Vec::new();
            for guard in &guards {
                if let Some(slot) = find_conflict(guard, &span, Some(id)) {
                    pending.push((guard.id, guard.name.clone(), slot.event_id));
                }
            }
            if !pending.is_empty() {
                drop(guards);
                drop(ev_guard);
                let conflicts = self.resolve_conflict_titles(pending).await;
                return Err(EngineError::Conflict(conflicts));
            }

            self.persist_one(Record::EventRescheduled {
                id,
                title: final_title.clone(),
                span: final_span,
                description: final_description.clone(),
            })
            .await?;

            for (alloc_id, rid) in &ev_guard.allocations {
                reschedule_slot(&mut guards[rs_map[rid]], *alloc_id, span);
            }
        } else {
            self.persist_one(Record::EventRescheduled {
                id,
                title: final_title.clone(),
                span: final_span,
                description: final_description.clone(),
            })
            .await?;
        }

        ev_guard.title = final_title;
        ev_guard.span = final_span;
        ev_guard.description = final_description;
        Ok(())
    }

    /// Delete an event and cascade: every allocation it holds is released.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let ev = self
            .store
            .get_event(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut ev_guard = ev.write_owned().await;

        let mut rids: Vec<Ulid> = ev_guard.allocations.iter().map(|(_, rid)| *rid).collect();
        rids.sort();
        rids.dedup();

        let mut guards = Vec::with_capacity(rids.len());
        let mut rs_map = HashMap::new();
        for rid in &rids {
            if let Some(rs) = self.store.get_resource(rid) {
                rs_map.insert(*rid, guards.len());
                guards.push(rs.write_owned().await);
            }
        }

        self.persist_one(Record::EventDeleted { id }).await?;

        for (alloc_id, rid) in ev_guard.allocations.drain(..) {
            if let Some(idx) = rs_map.get(&rid) {
                guards[*idx].remove_slot(alloc_id);
            }
            self.store.unmap_allocation(&alloc_id);
        }
        self.store.remove_event(&id);
        Ok(())
    }

    /// Release a single allocation without touching its event.
    pub async fn remove_allocation(&self, id: Ulid) -> Result<(Ulid, Ulid), EngineError> {
        let _commit = self.commit_gate.read().await;
        let resource_id = self
            .store
            .get_resource_for_allocation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;

        // Peek at the slot to learn the owning event, then re-acquire in
        // event-before-resource order.
        let event_id = {
            let guard = rs.read().await;
            guard
                .slots
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.event_id)
                .ok_or(EngineError::NotFound(id))?
        };
        let ev = self
            .store
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let mut ev_guard = ev.write().await;
        let mut rs_guard = rs.write().await;
        // Re-check under the write guard: the slot may have been removed, or
        // released and reissued to another event, while the locks were down.
        if !slot_owned_by(&rs_guard, id, event_id) {
            return Err(EngineError::NotFound(id));
        }

        self.persist_one(Record::AllocationRemoved {
            id,
            event_id,
            resource_id,
        })
        .await?;
        rs_guard.remove_slot(id);
        ev_guard.allocations.retain(|(aid, _)| *aid != id);
        self.store.unmap_allocation(&id);
        Ok((event_id, resource_id))
    }

    /// Turn raw (resource, name, busy-event) triples into conflict entries.
    /// Must be called with NO resource guards held: it takes event read locks,
    /// and events are always locked before resources.
    async fn resolve_conflict_titles(
        &self,
        pending: Vec<(Ulid, String, Ulid)>,
    ) -> Vec<ConflictEntry> {
        let mut entries = Vec::with_capacity(pending.len());
        for (resource_id, resource_name, event_id) in pending {
            let event_title = match self.store.get_event(&event_id) {
                Some(ev) => ev.read().await.title.clone(),
                None => "(deleted)".to_string(),
            };
            entries.push(ConflictEntry {
                resource_id,
                resource_name,
                event_id,
                event_title,
            });
        }
        entries
    }
}
