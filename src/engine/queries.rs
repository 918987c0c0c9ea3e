use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.store.resource_count());
        for id in self.store.resource_ids() {
            if let Some(rs) = self.store.get_resource(&id) {
                let guard = rs.read().await;
                out.push(ResourceInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    kind: guard.kind.clone(),
                    allocations: guard.slots.len(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// All events, newest start first.
    pub async fn list_events(&self) -> Vec<EventInfo> {
        let mut out = Vec::with_capacity(self.store.event_count());
        for id in self.store.event_ids() {
            if let Some(ev) = self.store.get_event(&id) {
                let guard = ev.read().await;
                out.push(EventInfo {
                    id: guard.id,
                    title: guard.title.clone(),
                    start: guard.span.start,
                    end: guard.span.end,
                    description: guard.description.clone(),
                });
            }
        }
        out.sort_by(|a, b| b.start.cmp(&a.start).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_event(&self, id: Ulid) -> Option<EventInfo> {
        let ev = self.store.get_event(&id)?;
        let guard = ev.read().await;
        Some(EventInfo {
            id: guard.id,
            title: guard.title.clone(),
            start: guard.span.start,
            end: guard.span.end,
            description: guard.description.clone(),
        })
    }

    /// Allocations on one resource, or on every resource, sorted by start.
    pub async fn list_allocations(&self, resource_id: Option<Ulid>) -> Vec<AllocationInfo> {
        let ids = match resource_id {
            Some(id) => vec![id],
            None => self.store.resource_ids(),
        };
        let mut out = Vec::new();
        for rid in ids {
            if let Some(rs) = self.store.get_resource(&rid) {
                let guard = rs.read().await;
                for slot in &guard.slots {
                    out.push(AllocationInfo {
                        id: slot.id,
                        event_id: slot.event_id,
                        resource_id: rid,
                        start: slot.span.start,
                        end: slot.span.end,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Dry-run conflict check: what would collide with this window on this
    /// resource? Commits nothing.
    pub async fn find_conflicts(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_event: Option<Ulid>,
    ) -> Result<Vec<ConflictEntry>, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("start must be before end"));
        }
        if end - start > MAX_REPORT_RANGE_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let span = Span::new(start, end);

        let mut pending = Vec::new();
        {
            let guard = rs.read().await;
            for slot in guard.overlapping(&span) {
                if exclude_event == Some(slot.event_id) {
                    continue;
                }
                pending.push((resource_id, guard.name.clone(), slot.event_id));
            }
        }

        let mut entries = Vec::with_capacity(pending.len());
        for (rid, rname, eid) in pending {
            let event_title = match self.store.get_event(&eid) {
                Some(ev) => ev.read().await.title.clone(),
                None => "(deleted)".to_string(),
            };
            entries.push(ConflictEntry {
                resource_id: rid,
                resource_name: rname,
                event_id: eid,
                event_title,
            });
        }
        Ok(entries)
    }
}
