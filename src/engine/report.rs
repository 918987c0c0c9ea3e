use crate::limits::*;
use crate::model::*;

use super::conflict::day_floor;
use super::{Engine, EngineError};

fn round_hours(ms: Ms) -> f64 {
    let hours = ms as f64 / HOUR_MS as f64;
    (hours * 100.0).round() / 100.0
}

impl Engine {
    /// Usage report over an inclusive day range: for every resource, the
    /// booked hours inside `[start_day, end_day]` (allocations clamped to the
    /// range boundaries) and the count of upcoming allocations (event starts
    /// strictly after `now`, independent of the range).
    pub async fn compute_usage(
        &self,
        start_day: Ms,
        end_day: Ms,
        now: Ms,
    ) -> Result<Vec<UsageRow>, EngineError> {
        let range_start = day_floor(start_day);
        // Inclusive of the whole end day, expressed half-open.
        let range_end = day_floor(end_day) + DAY_MS;
        if range_start >= range_end {
            return Err(EngineError::Validation("start day must not be after end day"));
        }
        if range_end - range_start > MAX_REPORT_RANGE_MS {
            return Err(EngineError::LimitExceeded("report range too wide"));
        }
        let range = Span::new(range_start, range_end);

        let mut rows = Vec::with_capacity(self.store.resource_count());
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;

            let mut booked_ms: Ms = 0;
            for slot in guard.overlapping(&range) {
                if let Some(clamped) = slot.span.intersect(&range) {
                    booked_ms += clamped.duration_ms();
                }
            }
            let upcoming = guard.slots.iter().filter(|s| s.span.start > now).count() as u64;

            rows.push(UsageRow {
                resource_id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind.clone(),
                booked_hours: round_hours(booked_ms),
                upcoming,
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.resource_id.cmp(&b.resource_id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::round_hours;
    use crate::model::HOUR_MS;

    #[test]
    fn hour_rounding_two_decimals() {
        assert_eq!(round_hours(90 * 60_000), 1.5);
        assert_eq!(round_hours(100 * 60_000), 1.67);
        assert_eq!(round_hours(HOUR_MS), 1.0);
        assert_eq!(round_hours(0), 0.0);
    }
}
