use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted input. `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1, e1)` and `[s2, e2)` intersect iff `s1 < e2 && s2 < e1`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether a booking in this status blocks its time range.
    pub fn occupies(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub duration_ms: Ms,
    pub price_cents: i64,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn interval(&self) -> BookingInterval {
        BookingInterval {
            id: self.id,
            span: self.span,
        }
    }
}

/// The part of a booking the overlap checker sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingInterval {
    pub id: Ulid,
    pub span: Span,
}

// ── Write inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub duration_ms: Ms,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStaff {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A booking as submitted by a client. Timestamps are not yet validated,
/// so this carries raw `start`/`end` rather than a `Span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub notes: Option<String>,
}

// Patches: `None` leaves a column untouched. For nullable columns the inner
// `Option` is the new value, so `Some(None)` sets NULL.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub duration_ms: Option<Ms>,
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaffPatch {
    pub name: Option<String>,
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub service_id: Option<Ulid>,
    pub staff_id: Option<Option<Ulid>>,
    pub customer_name: Option<String>,
    pub customer_email: Option<Option<String>>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub notes: Option<Option<String>>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == BookingPatch::default()
    }
}

/// Row filter for `SELECT ... FROM bookings`. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    /// Keep bookings overlapping `[from, ..)`.
    pub from: Option<Ms>,
    /// Keep bookings overlapping `[.., to)`.
    pub to: Option<Ms>,
}

/// The event types. This is the WAL record format; updates carry the full row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated(User),
    UserUpdated(User),
    UserDeleted { id: Ulid },
    ServiceCreated(Service),
    ServiceUpdated(Service),
    ServiceDeleted { id: Ulid },
    StaffCreated(StaffMember),
    StaffUpdated(StaffMember),
    StaffDeleted { id: Ulid },
    BookingCreated(Booking),
    /// A committed batch. One record, so it replays whole or not at all.
    BookingsCreated(Vec<Booking>),
    BookingUpdated(Booking),
    BookingDeleted { id: Ulid },
}
