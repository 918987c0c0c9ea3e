use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Midnight (UTC) of the day containing `t`.
pub(crate) fn day_floor(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

/// Validate a raw (start, end) pair into a Span. Rejects inverted and empty
/// windows before a Span is ever constructed.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::Validation("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// An event may not start on a day that is already over. Same-day is fine,
/// even when the start time itself has passed.
pub(crate) fn validate_not_past(span: &Span, now: Ms) -> Result<(), EngineError> {
    if day_floor(span.start) < day_floor(now) {
        return Err(EngineError::Validation("cannot schedule on a past date"));
    }
    Ok(())
}

/// Find the first allocation on `rs` overlapping `span`, skipping slots owned
/// by `exclude_event` (so an event being rescheduled doesn't conflict with
/// itself). Slots are sorted by start, so "first" means earliest-starting.
pub(crate) fn find_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude_event: Option<Ulid>,
) -> Option<AllocationSlot> {
    rs.overlapping(span)
        .find(|slot| exclude_event != Some(slot.event_id))
        .cloned()
}
