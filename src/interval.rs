//! Closed-interval arithmetic over UTC millisecond instants.
//!
//! Booking windows are compared with both endpoints inclusive: a booking that
//! ends at 10:00 collides with one that starts at 10:00. Aggregation clips each
//! booking to the query window and never produces a negative length.

use crate::model::Ms;

pub const MS_PER_MINUTE: Ms = 60_000;

/// True if `[a_enter, a_leave]` and `[b_enter, b_leave]` share at least one instant.
///
/// Four-way test: either endpoint of one interval lies inside the other.
pub fn overlaps(a_enter: Ms, a_leave: Ms, b_enter: Ms, b_leave: Ms) -> bool {
    within(b_enter, a_enter, a_leave)
        || within(b_leave, a_enter, a_leave)
        || within(a_enter, b_enter, b_leave)
        || within(a_leave, b_enter, b_leave)
}

fn within(t: Ms, lo: Ms, hi: Ms) -> bool {
    lo <= t && t <= hi
}

/// Length of `[enter, leave]` clipped to `[window_start, window_end]`. Zero when disjoint.
pub fn overlap_duration(enter: Ms, leave: Ms, window_start: Ms, window_end: Ms) -> Ms {
    (leave.min(window_end) - enter.max(window_start)).max(0)
}

/// Round to the nearest integer, ties to even: 2.5 → 2, 3.5 → 4.
pub fn round_half_even(value: f64) -> i64 {
    value.round_ties_even() as i64
}

pub fn ms_to_minutes(ms: Ms) -> f64 {
    ms as f64 / MS_PER_MINUTE as f64
}
