use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::timezone;

use super::conflict::{conflicts_in, validate_booking_span};
use super::{Engine, EngineError, WalCommand, move_booking, store_error};

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Directory ────────────────────────────────────────

    pub async fn create_organization(
        &self,
        id: Ulid,
        name: String,
        show_names: bool,
    ) -> Result<Organization, EngineError> {
        check_name(&name)?;
        let _dir = self.directory.write().await;
        if self.organizations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.organizations.len() >= MAX_ORGANIZATIONS {
            return Err(EngineError::LimitExceeded("too many organizations"));
        }
        let event = Event::OrganizationCreated {
            id,
            name: name.clone(),
            show_names,
        };
        self.persist_structural(&event).await?;
        info!("organization {id} created");
        Ok(Organization {
            id,
            name,
            show_names,
        })
    }

    pub async fn update_organization(
        &self,
        id: Ulid,
        name: String,
        show_names: bool,
    ) -> Result<Organization, EngineError> {
        check_name(&name)?;
        let _dir = self.directory.write().await;
        if !self.organizations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::OrganizationUpdated {
            id,
            name: name.clone(),
            show_names,
        };
        self.persist_structural(&event).await?;
        Ok(Organization {
            id,
            name,
            show_names,
        })
    }

    /// Removes the organization with its locations, spaces, bookings and users.
    pub async fn delete_organization(&self, id: Ulid) -> Result<(), EngineError> {
        let _dir = self.directory.write().await;
        if !self.organizations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let spaces = self.space_ids_of_org(&id).len();
        self.persist_structural(&Event::OrganizationDeleted { id }).await?;
        info!("organization {id} deleted with {spaces} spaces");
        Ok(())
    }

    pub async fn create_location(
        &self,
        id: Ulid,
        organization_id: Ulid,
        name: String,
        timezone: String,
    ) -> Result<Location, EngineError> {
        check_name(&name)?;
        timezone::resolve(&timezone)?;
        let _dir = self.directory.write().await;
        if self.locations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.organizations.contains_key(&organization_id) {
            return Err(EngineError::NotFound(organization_id));
        }
        let event = Event::LocationCreated {
            id,
            organization_id,
            name: name.clone(),
            timezone: timezone.clone(),
        };
        self.persist_structural(&event).await?;
        info!("location {id} created in {timezone}");
        Ok(Location {
            id,
            organization_id,
            name,
            timezone,
        })
    }

    pub async fn update_location(
        &self,
        id: Ulid,
        name: String,
        timezone: String,
    ) -> Result<Location, EngineError> {
        check_name(&name)?;
        timezone::resolve(&timezone)?;
        let _dir = self.directory.write().await;
        let organization_id = self
            .organization_of_location(&id)
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::LocationUpdated {
            id,
            name: name.clone(),
            timezone: timezone.clone(),
        };
        self.persist_structural(&event).await?;
        Ok(Location {
            id,
            organization_id,
            name,
            timezone,
        })
    }

    pub async fn delete_location(&self, id: Ulid) -> Result<(), EngineError> {
        let _dir = self.directory.write().await;
        if !self.locations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let spaces = self.space_ids_of_location(&id).len();
        self.persist_structural(&Event::LocationDeleted { id }).await?;
        info!("location {id} deleted with {spaces} spaces");
        Ok(())
    }

    pub async fn create_space(
        &self,
        id: Ulid,
        location_id: Ulid,
        name: String,
        layout: Layout,
    ) -> Result<SpaceInfo, EngineError> {
        check_name(&name)?;
        let _dir = self.directory.write().await;
        if self.spaces.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.locations.contains_key(&location_id) {
            return Err(EngineError::NotFound(location_id));
        }
        if self.space_ids_of_location(&location_id).len() >= MAX_SPACES_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many spaces in location"));
        }
        let event = Event::SpaceCreated {
            id,
            location_id,
            name: name.clone(),
            layout,
        };
        self.persist_structural(&event).await?;
        Ok(SpaceInfo {
            id,
            location_id,
            name,
            layout,
        })
    }

    pub async fn update_space(
        &self,
        id: Ulid,
        name: String,
        layout: Layout,
    ) -> Result<SpaceInfo, EngineError> {
        check_name(&name)?;
        let _dir = self.directory.write().await;
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let event = Event::SpaceUpdated { id, name, layout };
        self.persist_structural(&event).await?;
        let info = rs.read().await.info();
        Ok(info)
    }

    pub async fn delete_space(&self, id: Ulid) -> Result<(), EngineError> {
        let _dir = self.directory.write().await;
        let rs = self.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let bookings = rs.read().await.bookings.len();
        self.persist_structural(&Event::SpaceDeleted { id }).await?;
        info!("space {id} deleted with {bookings} bookings");
        Ok(())
    }

    /// Register a user. The email is stored lower-cased and must be unique.
    pub async fn create_user(&self, user: User) -> Result<User, EngineError> {
        let email = user.email.to_lowercase();
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        let _dir = self.directory.write().await;
        if self.users.contains_key(&user.id) {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if let Some(existing) = self.user_emails.get(&email) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }
        if !self.organizations.contains_key(&user.organization_id) {
            return Err(EngineError::NotFound(user.organization_id));
        }
        let user = User { email, ..user };
        let event = Event::UserCreated {
            id: user.id,
            organization_id: user.organization_id,
            email: user.email.clone(),
            org_admin: user.org_admin,
            super_admin: user.super_admin,
            hashed_password: user.hashed_password.clone(),
            auth_provider_id: user.auth_provider_id,
        };
        self.persist_structural(&event).await?;
        debug!("user {} created", user.id);
        Ok(user)
    }

    // ── Bookings ─────────────────────────────────────────

    fn check_membership(&self, user: &User, space: &SpaceState) -> Result<(), EngineError> {
        if self.organization_of_location(&space.location_id) != Some(user.organization_id) {
            return Err(EngineError::OrganizationMismatch {
                user_id: user.id,
                space_id: space.id,
            });
        }
        Ok(())
    }

    fn reject_conflicts(
        &self,
        space: &SpaceState,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if let Some(first) = conflicts_in(space, span, exclude).first() {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!("space {}: [{}, {}] collides with {}", space.id, span.start, span.end, first.id);
            return Err(EngineError::Conflict(first.id));
        }
        Ok(())
    }

    /// Book `space_id` for `user_id` over `[start, end]`. The conflict check and
    /// the write happen under the space's write lock, so two overlapping requests
    /// can never both succeed.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        space_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_booking_span(start, end)?;
        let _dir = self.directory.read().await;
        let user = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(user_id))?;
        let rs = self.get_space(&space_id).ok_or(EngineError::NotFound(space_id))?;
        let mut guard = rs.write().await;
        self.check_membership(&user, &guard)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many bookings on space"));
        }
        self.reject_conflicts(&guard, &span, None)?;

        let booking = Booking {
            id: Ulid::new(),
            user_id,
            space_id,
            span,
        };
        let event = Event::BookingCreated {
            id: booking.id,
            user_id,
            space_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => "create").increment(1);
        debug!("booking {} created on {space_id}", booking.id);
        Ok(booking)
    }

    fn space_of_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.booking_to_space
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))
    }

    /// Change a booking's interval and optionally its space. The booking does not
    /// conflict with itself. A move locks both spaces in id order.
    ///
    /// The booking's space is looked up before locking; if a concurrent move got
    /// there first, the lookup is repeated against the new space.
    pub async fn update_booking(
        &self,
        id: Ulid,
        space_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_booking_span(start, end)?;
        let _dir = self.directory.read().await;

        let updated = loop {
            let from_id = self.space_of_booking(id)?;

            if from_id == space_id {
                let rs = self.get_space(&space_id).ok_or(EngineError::NotFound(space_id))?;
                let mut guard = rs.write().await;
                let Some(existing) = guard.get_booking(id).cloned() else {
                    continue;
                };
                self.reject_conflicts(&guard, &span, Some(id))?;
                let event = Event::BookingUpdated { id, space_id, span };
                self.persist_and_apply(&mut guard, &event).await?;
                break Booking { span, ..existing };
            }

            let (lo, hi) = if from_id < space_id {
                (from_id, space_id)
            } else {
                (space_id, from_id)
            };
            let lo_rs = self.get_space(&lo).ok_or(EngineError::NotFound(lo))?;
            let hi_rs = self.get_space(&hi).ok_or(EngineError::NotFound(hi))?;
            let mut lo_guard = lo_rs.write_owned().await;
            let mut hi_guard = hi_rs.write_owned().await;
            let (from, to) = if from_id == lo {
                (&mut *lo_guard, &mut *hi_guard)
            } else {
                (&mut *hi_guard, &mut *lo_guard)
            };

            let Some(existing) = from.get_booking(id).cloned() else {
                continue;
            };
            let user = self
                .users
                .get(&existing.user_id)
                .map(|u| u.value().clone())
                .ok_or(EngineError::NotFound(existing.user_id))?;
            self.check_membership(&user, to)?;
            if to.bookings.len() >= MAX_BOOKINGS_PER_SPACE {
                return Err(EngineError::LimitExceeded("too many bookings on space"));
            }
            self.reject_conflicts(to, &span, Some(id))?;

            self.wal_append(&Event::BookingUpdated { id, space_id, span }).await?;
            move_booking(from, to, id, span, &self.booking_to_space);
            break Booking {
                space_id,
                span,
                ..existing
            };
        };

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => "update").increment(1);
        debug!("booking {id} updated on {space_id}");
        Ok(updated)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _dir = self.directory.read().await;
        loop {
            let space_id = self.space_of_booking(id)?;
            let rs = self.get_space(&space_id).ok_or(EngineError::NotFound(space_id))?;
            let mut guard = rs.write().await;
            // moved away while we waited for the lock
            let Some(booking) = guard.get_booking(id).cloned() else {
                continue;
            };
            self.persist_and_apply(&mut guard, &Event::BookingDeleted { id }).await?;
            metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => "delete").increment(1);
            debug!("booking {id} deleted from {space_id}");
            return Ok(booking);
        }
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Holds the directory exclusively, so no append can slip in between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _dir = self.directory.write().await;
        let mut events = Vec::new();

        let mut organizations: Vec<Organization> =
            self.organizations.iter().map(|e| e.value().clone()).collect();
        organizations.sort_by_key(|o| o.id);
        for o in organizations {
            events.push(Event::OrganizationCreated {
                id: o.id,
                name: o.name,
                show_names: o.show_names,
            });
        }

        let mut locations: Vec<Location> = self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        for l in locations {
            events.push(Event::LocationCreated {
                id: l.id,
                organization_id: l.organization_id,
                name: l.name,
                timezone: l.timezone,
            });
        }

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserCreated {
                id: u.id,
                organization_id: u.organization_id,
                email: u.email,
                org_admin: u.org_admin,
                super_admin: u.super_admin,
                hashed_password: u.hashed_password,
                auth_provider_id: u.auth_provider_id,
            });
        }

        let mut space_ids: Vec<Ulid> = self.spaces.iter().map(|e| *e.key()).collect();
        space_ids.sort();
        let mut bookings = Vec::new();
        for sid in space_ids {
            let Some(rs) = self.get_space(&sid) else {
                continue;
            };
            let guard = rs.read().await;
            events.push(Event::SpaceCreated {
                id: guard.id,
                location_id: guard.location_id,
                name: guard.name.clone(),
                layout: guard.layout,
            });
            bookings.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                id: b.id,
                user_id: b.user_id,
                space_id: b.space_id,
                span: b.span,
            }));
        }
        events.extend(bookings);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(store_error)?;
        info!("compacted {} to {count} events", self.wal_path().display());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
