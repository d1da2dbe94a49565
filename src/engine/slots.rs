use chrono::{NaiveDate, NaiveTime};
use tracing::debug;

use crate::limits::MAX_SLOTS_PER_PROVIDER;
use crate::model::*;

use super::{Engine, EngineError, NotFound, SchedulingConflict};

impl Engine {
    /// Publish an open slot `[start, end)` on `day` for a provider.
    ///
    /// The overlap check and the insert run under the provider's row lock, so
    /// two concurrent publishes for one provider cannot both pass the check.
    /// Booked slots count as collisions too.
    pub async fn publish_slot(
        &self,
        provider_id: ProviderId,
        day: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<SlotId, EngineError> {
        self.with_retry("publish_slot", || self.try_publish_slot(provider_id, day, start, end))
            .await
    }

    async fn try_publish_slot(
        &self,
        provider_id: ProviderId,
        day: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<SlotId, EngineError> {
        if !self.store.provider_exists(provider_id) {
            return Err(NotFound::Provider(provider_id).into());
        }
        let span = Span::new(start, end).ok_or(EngineError::InvalidInterval { start, end })?;

        let mut txn = self.begin();
        txn.hold(self.provider_locks.write(&provider_id, self.config.lock_timeout).await?);

        let existing = self.store.slots_of(provider_id);
        if existing.len() >= MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }
        if let Some(clash) = existing.iter().find(|s| s.collides_with(day, &span)) {
            return Err(SchedulingConflict::OverlapConflict { existing: clash.id }.into());
        }

        let id = self.store.next_slot_id();
        txn.stage(Change::SlotInserted(Slot {
            id,
            provider_id,
            day,
            span,
            booked: false,
        }));
        self.commit(txn).await?;
        debug!(provider_id, slot_id = id, %day, %span, "slot published");
        Ok(id)
    }

    /// Every slot of a provider ordered by `(day, start)`.
    pub fn list_slots(&self, provider_id: ProviderId) -> Result<Vec<Slot>, EngineError> {
        if !self.store.provider_exists(provider_id) {
            return Err(NotFound::Provider(provider_id).into());
        }
        let _view = self.store.read_view();
        Ok(self.store.slots_of(provider_id))
    }

    pub fn list_open_slots(&self, provider_id: ProviderId) -> Result<Vec<Slot>, EngineError> {
        self.slots_with_flag(provider_id, false)
    }

    pub fn list_booked_slots(&self, provider_id: ProviderId) -> Result<Vec<Slot>, EngineError> {
        self.slots_with_flag(provider_id, true)
    }

    fn slots_with_flag(&self, provider_id: ProviderId, booked: bool) -> Result<Vec<Slot>, EngineError> {
        let mut slots = self.list_slots(provider_id)?;
        slots.retain(|s| s.booked == booked);
        Ok(slots)
    }

    pub fn get_slot(&self, slot_id: SlotId) -> Result<Slot, EngineError> {
        self.store
            .slot(slot_id)
            .ok_or_else(|| NotFound::Slot(slot_id).into())
    }
}
