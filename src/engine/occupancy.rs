use std::time::Instant;

use serde::Serialize;
use ulid::Ulid;

use crate::interval::{ms_to_minutes, round_half_even};
use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, EngineError};

/// Booked time and load of one organization over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    pub booked_minutes: i64,
    pub space_count: usize,
    /// Percent of space-time capacity booked, 0–100.
    pub load: u8,
}

/// Sum of every booking's overlap with `window`, in ms. Bookings touching the
/// window only at an endpoint contribute zero.
pub fn booked_ms<'a>(spaces: impl IntoIterator<Item = &'a SpaceState>, window: &Span) -> Ms {
    spaces
        .into_iter()
        .flat_map(|rs| rs.overlapping(window))
        .map(|b| b.span.overlap_ms(window))
        .sum()
}

/// `booked / (window × spaces) × 100`, ties to even, capped at 100.
/// Zero spaces means zero load.
pub fn load_percent(booked_minutes: i64, window: &Span, space_count: usize) -> u8 {
    if space_count == 0 {
        return 0;
    }
    let capacity_minutes = ms_to_minutes(window.duration_ms()) * space_count as f64;
    if capacity_minutes <= 0.0 {
        return 0;
    }
    let percent = (booked_minutes as f64 / capacity_minutes * 100.0).min(100.0);
    round_half_even(percent).clamp(0, 100) as u8
}

impl Engine {
    /// Booked minutes and load for the organization over `[start, end]`, computed
    /// from one consistent snapshot of all its spaces.
    pub async fn occupancy(
        &self,
        organization_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Occupancy, EngineError> {
        let window = validate_window(start, end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let started = Instant::now();

        let _dir = self.directory.read().await;
        let snapshot = self.snapshot_org(&organization_id).await?;
        let booked = booked_ms(snapshot.iter().map(|g| &**g), &window);
        let booked_minutes = round_half_even(ms_to_minutes(booked));
        let space_count = snapshot.len();
        drop(snapshot);

        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "query" => "occupancy")
            .record(started.elapsed().as_secs_f64());

        Ok(Occupancy {
            booked_minutes,
            space_count,
            load: load_percent(booked_minutes, &window, space_count),
        })
    }

    pub async fn total_booked_minutes(
        &self,
        organization_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<i64, EngineError> {
        Ok(self.occupancy(organization_id, start, end).await?.booked_minutes)
    }

    pub async fn load(&self, organization_id: Ulid, start: Ms, end: Ms) -> Result<u8, EngineError> {
        Ok(self.occupancy(organization_id, start, end).await?.load)
    }
}
