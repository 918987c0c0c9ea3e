//! Hard input limits. These are defensive bounds on untrusted wire input,
//! not tuning knobs.

use crate::model::{Ms, DAY_MS};

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_EVENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KIND_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Resources per scheduling or allocation request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// 2000-01-01T00:00:00Z. Anything earlier is a unit mixup (seconds vs ms).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single event may not span more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

/// Usage report range cap: five years.
pub const MAX_REPORT_RANGE_MS: Ms = 5 * 366 * DAY_MS;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
