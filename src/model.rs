use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::interval;

/// Unix milliseconds, UTC. The only stored time type.
pub type Ms = i64;

/// Booking or query window `[start, end]`.
///
/// Both endpoints count when testing for overlap, so windows that touch at a
/// single instant collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        interval::overlaps(self.start, self.end, other.start, other.end)
    }

    /// Milliseconds of `self` that fall inside `window`.
    pub fn overlap_ms(&self, window: &Span) -> Ms {
        interval::overlap_duration(self.start, self.end, window.start, window.end)
    }
}

/// Floor-plan geometry of a space. Irrelevant to time logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub space_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Ulid,
    pub name: String,
    /// Members may see who booked what, not only their own bookings.
    pub show_names: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub name: String,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub email: String,
    pub org_admin: bool,
    pub super_admin: bool,
    #[serde(skip_serializing)]
    pub hashed_password: Option<String>,
    pub auth_provider_id: Option<Ulid>,
}

impl User {
    pub fn is_space_admin(&self) -> bool {
        self.org_admin || self.super_admin
    }
}

/// A space and its bookings. Bookings are kept sorted by `(span.start, id)`.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub layout: Layout,
    pub bookings: Vec<Booking>,
}

impl SpaceState {
    pub fn new(id: Ulid, location_id: Ulid, name: String, layout: Layout) -> Self {
        Self {
            id,
            location_id,
            name,
            layout,
            bookings: Vec::new(),
        }
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.span.start, booking.id);
        let pos = self
            .bookings
            .partition_point(|b| (b.span.start, b.id) < key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings sharing at least one instant with `query`, in stored order.
    /// Bookings starting after `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.overlaps(query))
    }

    pub fn info(&self) -> SpaceInfo {
        SpaceInfo {
            id: self.id,
            location_id: self.location_id,
            name: self.name.clone(),
            layout: self.layout,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrganizationCreated {
        id: Ulid,
        name: String,
        show_names: bool,
    },
    OrganizationUpdated {
        id: Ulid,
        name: String,
        show_names: bool,
    },
    /// Cascades to locations, spaces, bookings and users of the organization.
    OrganizationDeleted {
        id: Ulid,
    },
    LocationCreated {
        id: Ulid,
        organization_id: Ulid,
        name: String,
        timezone: String,
    },
    LocationUpdated {
        id: Ulid,
        name: String,
        timezone: String,
    },
    LocationDeleted {
        id: Ulid,
    },
    SpaceCreated {
        id: Ulid,
        location_id: Ulid,
        name: String,
        layout: Layout,
    },
    SpaceUpdated {
        id: Ulid,
        name: String,
        layout: Layout,
    },
    SpaceDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        organization_id: Ulid,
        email: String,
        org_admin: bool,
        super_admin: bool,
        hashed_password: Option<String>,
        auth_provider_id: Option<Ulid>,
    },
    BookingCreated {
        id: Ulid,
        user_id: Ulid,
        space_id: Ulid,
        span: Span,
    },
    /// May move the booking to another space.
    BookingUpdated {
        id: Ulid,
        space_id: Ulid,
        span: Span,
    },
    BookingDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    #[serde(flatten)]
    pub layout: Layout,
}

/// A booking joined with its space, location and booker email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub space: SpaceInfo,
    pub location: Location,
    pub user_email: String,
}
