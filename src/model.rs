use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The overlapping part of `self` and `other`; `None` when they only touch.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(Span::new(start, end))
        } else {
            None
        }
    }
}

/// A committed allocation as seen from its resource. The window is the owning
/// event's window, denormalized here so overlap scans stay local to the
/// resource; it is rewritten whenever the event is rescheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSlot {
    pub id: Ulid,
    pub event_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Free-text category: Room, Equipment, Instructor, ...
    pub kind: String,
    /// This resource's allocation slots, sorted by `span.start`.
    pub slots: Vec<AllocationSlot>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, kind: String) -> Self {
        Self {
            id,
            name,
            kind,
            slots: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: AllocationSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Remove a slot by allocation id.
    pub fn remove_slot(&mut self, id: Ulid) -> Option<AllocationSlot> {
        if let Some(pos) = self.slots.iter().position(|s| s.id == id) {
            Some(self.slots.remove(pos))
        } else {
            None
        }
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &AllocationSlot> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub id: Ulid,
    pub title: String,
    pub span: Span,
    pub description: Option<String>,
    /// (allocation id, resource id) pairs owned by this event.
    pub allocations: Vec<(Ulid, Ulid)>,
}

impl EventState {
    pub fn new(id: Ulid, title: String, span: Span, description: Option<String>) -> Self {
        Self {
            id,
            title,
            span,
            description,
            allocations: Vec::new(),
        }
    }

    pub fn holds_resource(&self, resource_id: Ulid) -> bool {
        self.allocations.iter().any(|(_, rid)| *rid == resource_id)
    }
}

/// The record types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    ResourceCreated {
        id: Ulid,
        name: String,
        kind: String,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: String,
    },
    ResourceDeleted {
        id: Ulid,
    },
    EventScheduled {
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    },
    EventRescheduled {
        id: Ulid,
        title: String,
        span: Span,
        description: Option<String>,
    },
    /// Cascades on replay: all of the event's allocations go with it.
    EventDeleted {
        id: Ulid,
    },
    AllocationAdded {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    AllocationRemoved {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub allocations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// One double-booking: which resource is busy, and which event holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub resource_id: Ulid,
    pub resource_name: String,
    pub event_id: Ulid,
    pub event_title: String,
}

/// Per-resource outcome of an incremental allocation batch. Every requested
/// resource lands in exactly one of the three lists.
#[derive(Debug, Clone, Default)]
pub struct AllocationReport {
    /// (allocation id, resource id) pairs that were committed.
    pub added: Vec<(Ulid, Ulid)>,
    pub conflicts: Vec<ConflictEntry>,
    /// Resources already allocated to the event (or repeated in the batch).
    pub duplicates: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub resource_id: Ulid,
    pub name: String,
    pub kind: String,
    /// Booked time inside the report range, rounded to 2 decimal places.
    pub booked_hours: f64,
    /// Allocations whose event starts strictly after `now`.
    pub upcoming: u64,
}
