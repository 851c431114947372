use std::time::Instant;

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;
use crate::timezone::LocalTime;

use super::conflict::validate_window;
use super::{Engine, EngineError};

/// Who is looking at an availability view, for redacting booker identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    /// Lower-cased, the same form user emails are stored in.
    pub email: String,
    /// Admins, or members of an organization that shows names to everyone.
    pub sees_all_names: bool,
}

impl Viewer {
    pub fn new(email: impl Into<String>, sees_all_names: bool) -> Self {
        Self {
            email: email.into().to_lowercase(),
            sees_all_names,
        }
    }

    pub fn can_see(&self, booker_email: &str) -> bool {
        self.sees_all_names
            || (!self.email.is_empty() && self.email == booker_email.to_lowercase())
    }
}

/// One booking as shown to a viewer, in the location's local time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSlot {
    pub id: Ulid,
    /// `None` when redacted.
    pub user_id: Option<Ulid>,
    pub user_email: Option<String>,
    pub enter: DateTime<Tz>,
    pub leave: DateTime<Tz>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceAvailability {
    #[serde(flatten)]
    pub space: SpaceInfo,
    pub available: bool,
    pub bookings: Vec<BookingSlot>,
}

/// Render a booking for `viewer`. Identity is kept only if the viewer sees all
/// names or booked it themselves; the decision is made per booking.
pub fn view_booking(
    booking: &Booking,
    booker_email: &str,
    local: &LocalTime,
    viewer: &Viewer,
) -> Result<BookingSlot, EngineError> {
    let visible = viewer.can_see(booker_email);
    Ok(BookingSlot {
        id: booking.id,
        user_id: visible.then_some(booking.user_id),
        user_email: visible.then(|| booker_email.to_string()),
        enter: local.to_local(booking.span.start)?,
        leave: local.to_local(booking.span.end)?,
    })
}

impl Engine {
    /// Spaces of a location with their bookings in `[enter, leave]`, both given
    /// as wall-clock times in the location's zone.
    pub async fn space_availability(
        &self,
        location_id: Ulid,
        enter: NaiveDateTime,
        leave: NaiveDateTime,
        viewer: &Viewer,
    ) -> Result<Vec<SpaceAvailability>, EngineError> {
        let location = self.get_location(location_id)?;
        let local = LocalTime::for_location(&location)?;
        let window = validate_window(local.to_utc(enter), local.to_utc(leave))?;
        self.space_availability_utc(location_id, window, viewer).await
    }

    /// As [`Engine::space_availability`], with the window already in UTC.
    pub async fn space_availability_utc(
        &self,
        location_id: Ulid,
        window: Span,
        viewer: &Viewer,
    ) -> Result<Vec<SpaceAvailability>, EngineError> {
        let window = validate_window(window.start, window.end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let started = Instant::now();

        let _dir = self.directory.read().await;
        let location = self.get_location(location_id)?;
        let local = LocalTime::for_location(&location)?;

        let mut result = Vec::new();
        for sid in self.space_ids_of_location(&location_id) {
            let Some(rs) = self.get_space(&sid) else {
                continue;
            };
            let guard = rs.read().await;
            let mut bookings = Vec::new();
            for booking in guard.overlapping(&window) {
                let email = self.user_email(&booking.user_id);
                bookings.push(view_booking(booking, &email, &local, viewer)?);
            }
            result.push(SpaceAvailability {
                space: guard.info(),
                available: bookings.is_empty(),
                bookings,
            });
        }
        result.sort_by(|a, b| a.space.name.cmp(&b.space.name).then(a.space.id.cmp(&b.space.id)));

        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "query" => "space_availability")
            .record(started.elapsed().as_secs_f64());
        Ok(result)
    }

    pub(super) fn user_email(&self, user_id: &Ulid) -> String {
        self.users
            .get(user_id)
            .map(|u| u.email.clone())
            .unwrap_or_default()
    }
}
