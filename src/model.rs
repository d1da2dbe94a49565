use chrono::{NaiveDate, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

pub type ProviderId = i64;
pub type SlotId = i64;
pub type ReservationId = i64;

/// Half-open overlap test: `[a_start, a_end)` and `[b_start, b_end)` share at
/// least one instant. Intervals that only touch at an endpoint do not overlap.
///
/// This is the single predicate behind both provider-slot collisions and
/// consumer-reservation collisions.
pub fn overlaps<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open time-of-day range `[start, end)` within a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    /// Returns `None` for empty or inverted ranges (`end <= start`).
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.format("%H:%M:%S"), self.end.format("%H:%M:%S"))
    }
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub surname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    pub username: String,
    pub name: String,
    pub surname: String,
    pub date_of_birth: NaiveDate,
    /// bcrypt hash (salt embedded). The raw secret is never stored.
    pub credential_hash: String,
}

impl Consumer {
    pub fn profile(&self) -> ConsumerProfile {
        ConsumerProfile {
            username: self.username.clone(),
            name: self.name.clone(),
            surname: self.surname.clone(),
            date_of_birth: self.date_of_birth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub provider_id: ProviderId,
    pub day: NaiveDate,
    pub span: Span,
    pub booked: bool,
}

impl Slot {
    /// Same calendar day and overlapping time range.
    pub fn collides_with(&self, day: NaiveDate, span: &Span) -> bool {
        self.day == day && self.span.overlaps(span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub consumer_username: String,
    pub provider_id: ProviderId,
    pub slot_id: SlotId,
    pub subject: String,
}

/// Input for `create_consumer`. Holds the raw secret only until it is hashed.
#[derive(Clone)]
pub struct NewConsumer {
    pub username: String,
    pub name: String,
    pub surname: String,
    pub date_of_birth: NaiveDate,
    pub secret: String,
}

impl std::fmt::Debug for NewConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewConsumer")
            .field("username", &self.username)
            .field("name", &self.name)
            .field("surname", &self.surname)
            .field("date_of_birth", &self.date_of_birth)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── WAL record format ────────────────────────────────────────────

/// Row-level write. A transaction stages a sequence of these and commits them
/// together as one [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    ProviderInserted(Provider),
    ConsumerInserted(Consumer),
    SlotInserted(Slot),
    SlotBookedSet { slot_id: SlotId, booked: bool },
    ReservationInserted(Reservation),
    ReservationDeleted { id: ReservationId },
    /// Highest id ever handed out per table. Written by compaction so ids
    /// burned before the snapshot are not reissued after a restart.
    SequenceFloor {
        provider: ProviderId,
        slot: SlotId,
        reservation: ReservationId,
    },
}

/// One committed transaction, stored as exactly one WAL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub changes: Vec<Change>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerProfile {
    pub username: String,
    pub name: String,
    pub surname: String,
    pub date_of_birth: NaiveDate,
}

/// A live reservation joined with its slot and provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationView {
    pub reservation_id: ReservationId,
    pub slot_id: SlotId,
    pub provider_id: ProviderId,
    pub day: NaiveDate,
    pub span: Span,
    pub provider_name: String,
    pub provider_surname: String,
    pub subject: String,
}
