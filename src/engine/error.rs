use chrono::NaiveTime;
use thiserror::Error;

use crate::model::{ProviderId, ReservationId, SlotId};

/// The entity a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("provider {0} not found")]
    Provider(ProviderId),
    #[error("provider {name} {surname} not found")]
    ProviderNamed { name: String, surname: String },
    #[error("consumer {0:?} not found")]
    Consumer(String),
    #[error("slot {0} not found")]
    Slot(SlotId),
    #[error("reservation {0} not found")]
    Reservation(ReservationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintViolation {
    #[error("username {0:?} already exists")]
    DuplicateUsername(String),
}

/// Scheduling rules a write would break.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingConflict {
    /// New slot overlaps an existing slot of the same provider on the same day.
    #[error("slot overlaps existing slot {existing}")]
    OverlapConflict { existing: SlotId },
    #[error("slot {0} is already booked")]
    SlotAlreadyBooked(SlotId),
    /// Consumer already holds an overlapping reservation on that day.
    #[error("overlaps reservation {existing} on the same day")]
    ScheduleConflict { existing: ReservationId },
    #[error("slot {slot_id} does not belong to provider {provider_id}")]
    SlotNotOwnedByProvider {
        slot_id: SlotId,
        provider_id: ProviderId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),
    #[error(transparent)]
    Conflict(#[from] SchedulingConflict),
    #[error("invalid interval: end {end} is not after start {start}")]
    InvalidInterval { start: NaiveTime, end: NaiveTime },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    /// Row lock not acquired in time. Consumed by the retry loop.
    #[error("lock contention")]
    Contention,
}

impl EngineError {
    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        EngineError::StorageFailure(e.to_string())
    }
}
