use tracing::debug;

use crate::limits::{MAX_RESERVATIONS_PER_CONSUMER, MAX_SUBJECT_LEN};
use crate::model::*;

use super::{Engine, EngineError, NotFound, SchedulingConflict};

impl Engine {
    /// Book `slot_id` of `provider_id` for a consumer.
    ///
    /// Locks the consumer row, then the slot row. Checks run in this order:
    /// consumer, provider, slot existence and ownership, slot still open, and
    /// no same-day overlap with the consumer's other reservations. The new
    /// reservation and the booked flag are committed as one WAL record.
    pub async fn reserve(
        &self,
        consumer_username: &str,
        provider_id: ProviderId,
        slot_id: SlotId,
        subject: &str,
    ) -> Result<ReservationId, EngineError> {
        if subject.len() > MAX_SUBJECT_LEN {
            return Err(EngineError::LimitExceeded("subject too long"));
        }
        self.with_retry("reserve", || {
            self.try_reserve(consumer_username, provider_id, slot_id, subject)
        })
        .await
    }

    async fn try_reserve(
        &self,
        username: &str,
        provider_id: ProviderId,
        slot_id: SlotId,
        subject: &str,
    ) -> Result<ReservationId, EngineError> {
        // Consumers, providers and slots are never deleted, so existence
        // checked before locking still holds after.
        if !self.store.consumer_exists(username) {
            return Err(NotFound::Consumer(username.to_string()).into());
        }
        let timeout = self.config.lock_timeout;
        let mut txn = self.begin();
        txn.hold(self.consumer_locks.write(&username.to_string(), timeout).await?);

        if !self.store.provider_exists(provider_id) {
            return Err(NotFound::Provider(provider_id).into());
        }
        if self.store.slot(slot_id).is_none() {
            return Err(NotFound::Slot(slot_id).into());
        }
        txn.hold(self.slot_locks.write(&slot_id, timeout).await?);

        let slot = self
            .store
            .slot(slot_id)
            .ok_or(NotFound::Slot(slot_id))?;
        if slot.provider_id != provider_id {
            return Err(SchedulingConflict::SlotNotOwnedByProvider { slot_id, provider_id }.into());
        }
        if slot.booked {
            return Err(SchedulingConflict::SlotAlreadyBooked(slot_id).into());
        }

        let held = self.store.reservations_of(username);
        if held.len() >= MAX_RESERVATIONS_PER_CONSUMER {
            return Err(EngineError::LimitExceeded("too many reservations for consumer"));
        }
        for r in &held {
            let Some(other) = self.store.slot(r.slot_id) else { continue };
            if other.id != slot.id && other.collides_with(slot.day, &slot.span) {
                return Err(SchedulingConflict::ScheduleConflict { existing: r.id }.into());
            }
        }

        let id = self.store.next_reservation_id();
        txn.stage(Change::ReservationInserted(Reservation {
            id,
            consumer_username: username.to_string(),
            provider_id,
            slot_id,
            subject: subject.to_string(),
        }));
        txn.stage(Change::SlotBookedSet { slot_id, booked: true });
        self.commit(txn).await?;
        debug!(reservation_id = id, username, provider_id, slot_id, "slot reserved");
        Ok(id)
    }

    /// Delete a reservation and reopen its slot in one commit. Returns the
    /// username that held it.
    pub async fn cancel(&self, reservation_id: ReservationId) -> Result<String, EngineError> {
        self.with_retry("cancel", || self.try_cancel(reservation_id)).await
    }

    async fn try_cancel(&self, reservation_id: ReservationId) -> Result<String, EngineError> {
        let seen = self
            .store
            .reservation(reservation_id)
            .ok_or(NotFound::Reservation(reservation_id))?;

        let timeout = self.config.lock_timeout;
        let mut txn = self.begin();
        txn.hold(self.consumer_locks.write(&seen.consumer_username, timeout).await?);
        txn.hold(self.slot_locks.write(&seen.slot_id, timeout).await?);

        // A concurrent cancel may have won while we waited.
        let reservation = self
            .store
            .reservation(reservation_id)
            .ok_or(NotFound::Reservation(reservation_id))?;

        txn.stage(Change::SlotBookedSet { slot_id: reservation.slot_id, booked: false });
        txn.stage(Change::ReservationDeleted { id: reservation_id });
        self.commit(txn).await?;
        debug!(reservation_id, username = %reservation.consumer_username, "reservation cancelled");
        Ok(reservation.consumer_username)
    }

    pub fn get_reservation(&self, reservation_id: ReservationId) -> Result<Reservation, EngineError> {
        self.store
            .reservation(reservation_id)
            .ok_or_else(|| NotFound::Reservation(reservation_id).into())
    }
}
