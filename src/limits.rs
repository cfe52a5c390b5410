//! Hard limits applied at the write boundary. Anything past these is rejected
//! with `EngineError::LimitExceeded` before touching the WAL.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not run longer than 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Service durations are capped at one day.
pub const MAX_SERVICE_DURATION_MS: Ms = 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 64;
pub const MAX_TEXT_LEN: usize = 4096;

pub const MAX_USERS_PER_TENANT: usize = 10_000;
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_STAFF_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_TENANT: usize = 1_000_000;

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
