//! UTC ⇄ location wall-clock translation.
//!
//! Storage is UTC milliseconds. Requests arrive as wall-clock times in the
//! location's zone and responses are rendered back in that zone, so a booking
//! entered as 09:00–17:00 local reads 09:00–17:00 local regardless of which
//! side of a DST transition it lies on.

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::limits::MAX_TIMEZONE_LEN;
use crate::model::{Location, Ms};

pub fn resolve(name: &str) -> Result<Tz, EngineError> {
    if name.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::TimezoneResolution(name.to_string()));
    }
    name.parse::<Tz>()
        .map_err(|_| EngineError::TimezoneResolution(name.to_string()))
}

/// Translator bound to one location's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    tz: Tz,
}

impl LocalTime {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn for_location(location: &Location) -> Result<Self, EngineError> {
        resolve(&location.timezone).map(Self::new)
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn to_local(&self, utc: Ms) -> Result<DateTime<Tz>, EngineError> {
        let instant = DateTime::<Utc>::from_timestamp_millis(utc)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        Ok(instant.with_timezone(&self.tz))
    }

    /// Wall-clock → UTC.
    ///
    /// In the autumn fold the earlier instant wins. A wall-clock inside the
    /// spring gap is read with the offset in force before the gap, which lands
    /// just past the transition (02:30 → 03:30 summer time).
    pub fn to_utc(&self, wall: NaiveDateTime) -> Ms {
        match self.tz.from_local_datetime(&wall) {
            LocalResult::Single(dt) => dt.timestamp_millis(),
            LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
            LocalResult::None => {
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(wall - TimeDelta::days(1)))
                    .fix();
                let utc = wall - TimeDelta::seconds(i64::from(before.local_minus_utc()));
                utc.and_utc().timestamp_millis()
            }
        }
    }
}

pub fn to_local(utc: Ms, location: &Location) -> Result<DateTime<Tz>, EngineError> {
    LocalTime::for_location(location)?.to_local(utc)
}

pub fn to_utc(wall: NaiveDateTime, location: &Location) -> Result<Ms, EngineError> {
    Ok(LocalTime::for_location(location)?.to_utc(wall))
}
