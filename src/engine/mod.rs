mod availability;
mod conflict;
mod error;
mod mutations;
mod occupancy;
mod queries;

pub use availability::{BookingSlot, SpaceAvailability, Viewer, view_booking};
pub use conflict::{conflicts_in, validate_booking_span, validate_window};
pub use error::EngineError;
pub use occupancy::{Occupancy, booked_ms, load_percent};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // flush this batch before the non-append command runs
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Booking store and directory for every organization.
///
/// State lives in memory and every change is journaled to the WAL before it is
/// applied. Construct one per process with [`Engine::open`] and share it by `Arc`.
///
/// Locking: `directory` is taken exclusively by structural changes (orgs,
/// locations, spaces, users) and by compaction, shared by everything else. Each
/// space has its own lock; booking writers hold it across conflict check, WAL
/// append and apply, so check-then-write is atomic per space.
pub struct Engine {
    pub(super) directory: RwLock<()>,
    pub(super) organizations: DashMap<Ulid, Organization>,
    pub(super) locations: DashMap<Ulid, Location>,
    pub(super) spaces: DashMap<Ulid, SharedSpaceState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lower-cased email → user id.
    pub(super) user_emails: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → space id.
    pub(super) booking_to_space: DashMap<Ulid, Ulid>,
    pub(super) org_locations: DashMap<Ulid, Vec<Ulid>>,
    pub(super) location_spaces: DashMap<Ulid, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    wal_path: PathBuf,
}

/// Apply a single-space booking event to a locked space.
pub(super) fn apply_to_space(rs: &mut SpaceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            user_id,
            space_id,
            span,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                user_id: *user_id,
                space_id: *space_id,
                span: *span,
            });
            index.insert(*id, *space_id);
        }
        Event::BookingUpdated { id, span, .. } => {
            if let Some(mut booking) = rs.remove_booking(*id) {
                booking.span = *span;
                rs.insert_booking(booking);
            }
        }
        Event::BookingDeleted { id } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
        _ => {}
    }
}

/// Move a booking between two locked spaces, giving it a new span.
pub(super) fn move_booking(
    from: &mut SpaceState,
    to: &mut SpaceState,
    id: Ulid,
    span: Span,
    index: &DashMap<Ulid, Ulid>,
) {
    if let Some(mut booking) = from.remove_booking(id) {
        booking.space_id = to.id;
        booking.span = span;
        to.insert_booking(booking);
        index.insert(id, to.id);
    }
}

impl Engine {
    /// Open the store at `wal_path`: replay the log into memory and start the
    /// group-commit writer. Must run inside a Tokio runtime.
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let wal_path = wal_path.as_ref().to_path_buf();
        let events = Wal::replay(&wal_path).map_err(store_error)?;
        let wal = Wal::open(&wal_path).map_err(store_error)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            directory: RwLock::new(()),
            organizations: DashMap::new(),
            locations: DashMap::new(),
            spaces: DashMap::new(),
            users: DashMap::new(),
            user_emails: DashMap::new(),
            booking_to_space: DashMap::new(),
            org_locations: DashMap::new(),
            location_spaces: DashMap::new(),
            wal_tx,
            wal_path,
        };

        for event in &events {
            engine.apply_event(event).await;
        }
        info!(
            "opened {}: replayed {} events ({} organizations, {} spaces, {} bookings)",
            engine.wal_path.display(),
            events.len(),
            engine.organizations.len(),
            engine.spaces.len(),
            engine.booking_to_space.len(),
        );

        Ok(engine)
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(store_error)
    }

    /// WAL-append + apply for a booking event on an already locked space.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(rs, event, &self.booking_to_space);
        Ok(())
    }

    /// WAL-append + apply for a structural event. Caller holds `directory` exclusively.
    pub(super) async fn persist_structural(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(event).await;
        Ok(())
    }

    pub(super) fn get_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub(super) fn space_ids_of_location(&self, location_id: &Ulid) -> Vec<Ulid> {
        self.location_spaces
            .get(location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub(super) fn space_ids_of_org(&self, organization_id: &Ulid) -> Vec<Ulid> {
        let location_ids = self
            .org_locations
            .get(organization_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut ids: Vec<Ulid> = location_ids
            .iter()
            .flat_map(|lid| self.space_ids_of_location(lid))
            .collect();
        ids.sort();
        ids
    }

    pub(super) fn organization_of_location(&self, location_id: &Ulid) -> Option<Ulid> {
        self.locations.get(location_id).map(|l| l.organization_id)
    }

    /// Read-lock every space of the organization in id order. Holding the
    /// returned guards gives a consistent snapshot across spaces.
    pub(super) async fn snapshot_org(
        &self,
        organization_id: &Ulid,
    ) -> Result<Vec<OwnedRwLockReadGuard<SpaceState>>, EngineError> {
        if !self.organizations.contains_key(organization_id) {
            return Err(EngineError::NotFound(*organization_id));
        }
        let mut guards = Vec::new();
        for sid in self.space_ids_of_org(organization_id) {
            if let Some(rs) = self.get_space(&sid) {
                guards.push(rs.read_owned().await);
            }
        }
        Ok(guards)
    }

    /// Apply any event to in-memory state. Used for replay and for structural
    /// changes made under the exclusive directory lock, where no space lock is held.
    pub(super) async fn apply_event(&self, event: &Event) {
        match event {
            Event::OrganizationCreated { id, name, show_names }
            | Event::OrganizationUpdated { id, name, show_names } => {
                self.organizations.insert(
                    *id,
                    Organization {
                        id: *id,
                        name: name.clone(),
                        show_names: *show_names,
                    },
                );
            }
            Event::OrganizationDeleted { id } => self.remove_organization(id).await,
            Event::LocationCreated {
                id,
                organization_id,
                name,
                timezone,
            } => {
                self.locations.insert(
                    *id,
                    Location {
                        id: *id,
                        organization_id: *organization_id,
                        name: name.clone(),
                        timezone: timezone.clone(),
                    },
                );
                self.org_locations.entry(*organization_id).or_default().push(*id);
            }
            Event::LocationUpdated { id, name, timezone } => {
                if let Some(mut loc) = self.locations.get_mut(id) {
                    loc.name = name.clone();
                    loc.timezone = timezone.clone();
                }
            }
            Event::LocationDeleted { id } => self.remove_location(id).await,
            Event::SpaceCreated {
                id,
                location_id,
                name,
                layout,
            } => {
                let rs = SpaceState::new(*id, *location_id, name.clone(), *layout);
                self.spaces.insert(*id, Arc::new(RwLock::new(rs)));
                self.location_spaces.entry(*location_id).or_default().push(*id);
            }
            Event::SpaceUpdated { id, name, layout } => {
                if let Some(rs) = self.get_space(id) {
                    let mut guard = rs.write().await;
                    guard.name = name.clone();
                    guard.layout = *layout;
                }
            }
            Event::SpaceDeleted { id } => self.remove_space(id).await,
            Event::UserCreated {
                id,
                organization_id,
                email,
                org_admin,
                super_admin,
                hashed_password,
                auth_provider_id,
            } => {
                self.user_emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        organization_id: *organization_id,
                        email: email.clone(),
                        org_admin: *org_admin,
                        super_admin: *super_admin,
                        hashed_password: hashed_password.clone(),
                        auth_provider_id: *auth_provider_id,
                    },
                );
            }
            Event::BookingCreated { space_id, .. } => {
                if let Some(rs) = self.get_space(space_id) {
                    let mut guard = rs.write().await;
                    apply_to_space(&mut guard, event, &self.booking_to_space);
                }
            }
            Event::BookingUpdated { id, space_id, span } => {
                let Some(from_id) = self.booking_to_space.get(id).map(|e| *e.value()) else {
                    return;
                };
                if from_id == *space_id {
                    if let Some(rs) = self.get_space(space_id) {
                        let mut guard = rs.write().await;
                        apply_to_space(&mut guard, event, &self.booking_to_space);
                    }
                } else if let (Some(from), Some(to)) =
                    (self.get_space(&from_id), self.get_space(space_id))
                {
                    let mut from_guard = from.write().await;
                    let mut to_guard = to.write().await;
                    move_booking(&mut from_guard, &mut to_guard, *id, *span, &self.booking_to_space);
                }
            }
            Event::BookingDeleted { id } => {
                let Some(space_id) = self.booking_to_space.get(id).map(|e| *e.value()) else {
                    return;
                };
                if let Some(rs) = self.get_space(&space_id) {
                    let mut guard = rs.write().await;
                    apply_to_space(&mut guard, event, &self.booking_to_space);
                }
            }
        }
    }

    async fn remove_space(&self, id: &Ulid) {
        let Some((_, rs)) = self.spaces.remove(id) else {
            return;
        };
        let guard = rs.read().await;
        for booking in &guard.bookings {
            self.booking_to_space.remove(&booking.id);
        }
        if let Some(mut ids) = self.location_spaces.get_mut(&guard.location_id) {
            ids.retain(|s| s != id);
        }
    }

    async fn remove_location(&self, id: &Ulid) {
        for sid in self.space_ids_of_location(id) {
            self.remove_space(&sid).await;
        }
        self.location_spaces.remove(id);
        if let Some((_, loc)) = self.locations.remove(id)
            && let Some(mut ids) = self.org_locations.get_mut(&loc.organization_id)
        {
            ids.retain(|l| l != id);
        }
    }

    async fn remove_organization(&self, id: &Ulid) {
        let location_ids = self
            .org_locations
            .get(id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for lid in location_ids {
            self.remove_location(&lid).await;
        }
        self.org_locations.remove(id);
        self.users.retain(|_, u| u.organization_id != *id);
        self.user_emails.retain(|_, uid| self.users.contains_key(uid));
        self.organizations.remove(id);
    }
}

pub(super) fn store_error(e: io::Error) -> EngineError {
    EngineError::StoreUnavailable(e.to_string())
}
