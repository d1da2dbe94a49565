use crate::model::*;

use super::{Engine, EngineError, NotFound};

impl Engine {
    /// A consumer's live reservations joined with slot and provider rows,
    /// ordered by `(day, start, reservation id)`.
    ///
    /// Holds the consumer's shared row lock, so no reserve or cancel for
    /// this consumer lands halfway through the join.
    pub async fn history(&self, consumer_username: &str) -> Result<Vec<ReservationView>, EngineError> {
        self.with_retry("history", || self.try_history(consumer_username))
            .await
    }

    async fn try_history(&self, username: &str) -> Result<Vec<ReservationView>, EngineError> {
        if !self.store.consumer_exists(username) {
            return Err(NotFound::Consumer(username.to_string()).into());
        }
        let _shared = self
            .consumer_locks
            .read(&username.to_string(), self.config.lock_timeout)
            .await?;
        self.join_history(username)
    }

    fn join_history(&self, username: &str) -> Result<Vec<ReservationView>, EngineError> {
        let _view = self.store.read_view();
        let mut views = Vec::new();
        for r in self.store.reservations_of(username) {
            let slot = self.store.slot(r.slot_id).ok_or_else(|| {
                EngineError::StorageFailure(format!("reservation {} points at missing slot {}", r.id, r.slot_id))
            })?;
            let provider = self.store.provider(r.provider_id).ok_or_else(|| {
                EngineError::StorageFailure(format!(
                    "reservation {} points at missing provider {}",
                    r.id, r.provider_id
                ))
            })?;
            views.push(ReservationView {
                reservation_id: r.id,
                slot_id: slot.id,
                provider_id: provider.id,
                day: slot.day,
                span: slot.span,
                provider_name: provider.name,
                provider_surname: provider.surname,
                subject: r.subject,
            });
        }
        views.sort_by_key(|v| (v.day, v.span.start, v.reservation_id));
        Ok(views)
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        self.store.providers()
    }

    pub fn get_provider(&self, provider_id: ProviderId) -> Result<Provider, EngineError> {
        self.store
            .provider(provider_id)
            .ok_or_else(|| NotFound::Provider(provider_id).into())
    }

    /// Exact match on name and surname. With several matches the lowest id wins.
    pub fn find_provider_by_name(&self, name: &str, surname: &str) -> Result<Provider, EngineError> {
        self.store
            .providers()
            .into_iter()
            .find(|p| p.name == name && p.surname == surname)
            .ok_or_else(|| {
                NotFound::ProviderNamed {
                    name: name.to_string(),
                    surname: surname.to_string(),
                }
                .into()
            })
    }

    /// Profiles only; credential hashes never leave the engine.
    pub fn list_consumers(&self) -> Vec<ConsumerProfile> {
        self.store.consumers().iter().map(Consumer::profile).collect()
    }

    pub fn find_consumer_by_username(&self, username: &str) -> Result<ConsumerProfile, EngineError> {
        self.store
            .consumer(username)
            .map(|c| c.profile())
            .ok_or_else(|| NotFound::Consumer(username.to_string()).into())
    }
}
