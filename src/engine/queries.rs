use std::time::Instant;

use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::availability::Viewer;
use super::conflict::validate_window;
use super::{Engine, EngineError};

fn by_enter(a: &Booking, b: &Booking) -> std::cmp::Ordering {
    (a.span.start, a.id).cmp(&(b.span.start, b.id))
}

impl Engine {
    pub fn get_organization(&self, id: Ulid) -> Result<Organization, EngineError> {
        self.organizations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn get_location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.locations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.user_emails.get(&email.to_lowercase())?.value();
        self.get_user(id).ok()
    }

    pub async fn space_info(&self, id: Ulid) -> Result<SpaceInfo, EngineError> {
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let info = rs.read().await.info();
        Ok(info)
    }

    /// Locations of an organization, ordered by name.
    pub fn list_locations(&self, organization_id: Ulid) -> Result<Vec<Location>, EngineError> {
        if !self.organizations.contains_key(&organization_id) {
            return Err(EngineError::NotFound(organization_id));
        }
        let ids = self
            .org_locations
            .get(&organization_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut locations: Vec<Location> = ids
            .iter()
            .filter_map(|id| self.locations.get(id).map(|e| e.value().clone()))
            .collect();
        locations.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(locations)
    }

    /// Spaces of a location, ordered by name.
    pub async fn list_spaces(&self, location_id: Ulid) -> Result<Vec<SpaceInfo>, EngineError> {
        let _dir = self.directory.read().await;
        if !self.locations.contains_key(&location_id) {
            return Err(EngineError::NotFound(location_id));
        }
        let mut spaces = Vec::new();
        for sid in self.space_ids_of_location(&location_id) {
            if let Some(rs) = self.get_space(&sid) {
                spaces.push(rs.read().await.info());
            }
        }
        spaces.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(spaces)
    }

    /// A booking with its space, location and the booker's email.
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingDetails, EngineError> {
        let _dir = self.directory.read().await;
        let space_id = self
            .booking_to_space
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.get_space(&space_id).ok_or(EngineError::NotFound(space_id))?;
        let guard = rs.read().await;
        let booking = guard.get_booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let location = self.get_location(guard.location_id)?;
        Ok(BookingDetails {
            user_email: self.user_email(&booking.user_id),
            booking,
            space: guard.info(),
            location,
        })
    }

    /// Every booking of the organization overlapping `[start, end]`, ordered by
    /// enter then id.
    pub async fn bookings_by_org(
        &self,
        organization_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let window = validate_window(start, end)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let started = Instant::now();
        let _dir = self.directory.read().await;
        let snapshot = self.snapshot_org(&organization_id).await?;
        let mut bookings: Vec<Booking> = snapshot
            .iter()
            .flat_map(|g| g.overlapping(&window))
            .cloned()
            .collect();
        drop(snapshot);
        bookings.sort_by(by_enter);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "query" => "bookings_by_org")
            .record(started.elapsed().as_secs_f64());
        Ok(bookings)
    }

    /// The user's bookings that have not ended before `since`, ordered by enter.
    pub async fn bookings_by_user(&self, user_id: Ulid, since: Ms) -> Result<Vec<Booking>, EngineError> {
        let _dir = self.directory.read().await;
        let user = self.get_user(user_id)?;
        let snapshot = self.snapshot_org(&user.organization_id).await?;
        let mut bookings: Vec<Booking> = snapshot
            .iter()
            .flat_map(|g| g.bookings.iter())
            .filter(|b| b.user_id == user_id && b.span.end >= since)
            .cloned()
            .collect();
        drop(snapshot);
        bookings.sort_by(by_enter);
        Ok(bookings)
    }

    pub async fn booking_count(&self, organization_id: Ulid) -> Result<usize, EngineError> {
        let _dir = self.directory.read().await;
        let snapshot = self.snapshot_org(&organization_id).await?;
        Ok(snapshot.iter().map(|g| g.bookings.len()).sum())
    }

    pub async fn booking_count_in_range(
        &self,
        organization_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<usize, EngineError> {
        let window = validate_window(start, end)?;
        let _dir = self.directory.read().await;
        let snapshot = self.snapshot_org(&organization_id).await?;
        Ok(snapshot.iter().map(|g| g.overlapping(&window).count()).sum())
    }

    pub async fn space_count(&self, organization_id: Ulid) -> Result<usize, EngineError> {
        let _dir = self.directory.read().await;
        if !self.organizations.contains_key(&organization_id) {
            return Err(EngineError::NotFound(organization_id));
        }
        Ok(self.space_ids_of_org(&organization_id).len())
    }

    /// Default visibility for a user: admins and members of organizations that
    /// show names see every booker, everyone else only themselves.
    pub fn viewer_for(&self, user_id: Ulid) -> Result<Viewer, EngineError> {
        let user = self.get_user(user_id)?;
        let show_names = self.get_organization(user.organization_id)?.show_names;
        Ok(Viewer::new(user.email.clone(), user.is_space_admin() || show_names))
    }
}
