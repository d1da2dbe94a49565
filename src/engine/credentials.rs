use tracing::{debug, warn};

use crate::limits::{MAX_NAME_LEN, MAX_SECRET_LEN, MAX_USERNAME_LEN};
use crate::model::*;

use super::{ConstraintViolation, Engine, EngineError, NotFound};

fn require_name(value: &str, empty: &'static str, too_long: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(empty));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

impl Engine {
    pub async fn create_provider(&self, name: &str, surname: &str) -> Result<ProviderId, EngineError> {
        require_name(name, "provider name is empty", "provider name too long")?;
        require_name(surname, "provider surname is empty", "provider surname too long")?;

        let id = self.store.next_provider_id();
        let mut txn = self.begin();
        txn.stage(Change::ProviderInserted(Provider {
            id,
            name: name.to_string(),
            surname: surname.to_string(),
        }));
        self.commit(txn).await?;
        debug!(provider_id = id, "provider created");
        Ok(id)
    }

    /// Register a consumer. The secret is bcrypt-hashed on a blocking thread
    /// and only the hash is stored.
    pub async fn create_consumer(&self, new: NewConsumer) -> Result<(), EngineError> {
        if new.username.trim().is_empty() {
            return Err(EngineError::InvalidInput("username is empty"));
        }
        if new.username.len() > MAX_USERNAME_LEN {
            return Err(EngineError::LimitExceeded("username too long"));
        }
        require_name(&new.name, "consumer name is empty", "consumer name too long")?;
        require_name(&new.surname, "consumer surname is empty", "consumer surname too long")?;
        if new.secret.is_empty() {
            return Err(EngineError::InvalidInput("password is empty"));
        }
        if new.secret.len() > MAX_SECRET_LEN {
            return Err(EngineError::LimitExceeded("password too long"));
        }
        // Cheap rejection before paying for the hash. The commit re-checks.
        if self.store.consumer_exists(&new.username) {
            return Err(ConstraintViolation::DuplicateUsername(new.username).into());
        }

        let cost = self.config.bcrypt_cost;
        let secret = new.secret.clone();
        let credential_hash = tokio::task::spawn_blocking(move || bcrypt::hash(secret, cost))
            .await
            .map_err(EngineError::storage)?
            .map_err(EngineError::storage)?;

        let consumer = Consumer {
            username: new.username,
            name: new.name,
            surname: new.surname,
            date_of_birth: new.date_of_birth,
            credential_hash,
        };
        self.with_retry("create_consumer", || self.try_insert_consumer(&consumer))
            .await?;
        debug!(username = %consumer.username, "consumer created");
        Ok(())
    }

    async fn try_insert_consumer(&self, consumer: &Consumer) -> Result<(), EngineError> {
        let mut txn = self.begin();
        txn.hold(
            self.consumer_locks
                .write(&consumer.username, self.config.lock_timeout)
                .await?,
        );
        if self.store.consumer_exists(&consumer.username) {
            return Err(ConstraintViolation::DuplicateUsername(consumer.username.clone()).into());
        }
        txn.stage(Change::ConsumerInserted(consumer.clone()));
        self.commit(txn).await
    }

    /// Check a username/secret pair against the stored bcrypt hash.
    pub async fn verify_credentials(&self, username: &str, secret: &str) -> Result<ConsumerProfile, EngineError> {
        let consumer = self
            .store
            .consumer(username)
            .ok_or_else(|| NotFound::Consumer(username.to_string()))?;

        let hash = consumer.credential_hash.clone();
        let secret = secret.to_string();
        let matches = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .map_err(EngineError::storage)?
            .map_err(EngineError::storage)?;

        if !matches {
            warn!(username, "credential check failed");
            return Err(EngineError::InvalidCredentials);
        }
        Ok(consumer.profile())
    }
}
