use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_TIMEZONE_LEN: usize = 64;

pub const MAX_ORGANIZATIONS: usize = 100_000;
pub const MAX_SPACES_PER_LOCATION: usize = 10_000;
pub const MAX_BOOKINGS_PER_SPACE: usize = 100_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_BOOKING_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
