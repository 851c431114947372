use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Reject empty or reversed windows and instants outside the supported range.
pub fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

pub fn validate_booking_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_window(start, end)?;
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Bookings of `rs` that collide with `span`, skipping `exclude`, ordered by enter.
pub fn conflicts_in(rs: &SpaceState, span: &Span, exclude: Option<Ulid>) -> Vec<Booking> {
    rs.overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .cloned()
        .collect()
}

impl Engine {
    /// Every booking on `space_id` whose interval overlaps `[start, end]`, endpoints
    /// inclusive, ordered by enter. `exclude` drops the booking being revalidated
    /// during an update. An empty result means the interval is free.
    ///
    /// This is a read: a caller that writes afterwards must hold the space lock
    /// across both steps, as `create_booking` and `update_booking` do.
    pub async fn find_conflicts(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let span = validate_window(start, end)?;
        let _dir = self.directory.read().await;
        let rs = self
            .get_space(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let guard = rs.read().await;
        Ok(conflicts_in(&guard, &span, exclude))
    }
}
