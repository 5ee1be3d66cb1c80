//! Device Token Registry
//!
//! One hash per user, `user_tokens:{user_id}`, with one field per device
//! class holding the currently valid token. Issuing a token overwrites the
//! field for that device class only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{deny, DenialReason, DeviceClass};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, FastCache, UserId};
use crate::error::Result;

pub const TOKEN_KEY_PREFIX: &str = "user_tokens:";

/// What a client presents on every authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: UserId,
    pub device: DeviceClass,
    pub token: String,
}

fn tokens_match(presented: &str, stored: &str) -> bool {
    presented.len() == stored.len()
        && presented
            .bytes()
            .zip(stored.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub struct SessionRegistry {
    cache: Arc<dyn FastCache>,
    token_ttl: Duration,
    events: Arc<dyn EventPublisher>,
}

impl SessionRegistry {
    pub fn new(
        cache: Arc<dyn FastCache>,
        token_ttl: Duration,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            token_ttl,
            events,
        }
    }

    pub fn token_key(user_id: UserId) -> String {
        format!("{}{}", TOKEN_KEY_PREFIX, user_id)
    }

    /// Issue a fresh token for `device`, replacing any previous one.
    #[instrument(skip(self), fields(user_id = %user_id, device = %device))]
    pub async fn issue(&self, user_id: UserId, device: DeviceClass) -> Result<Credentials> {
        let token = Uuid::new_v4().simple().to_string();

        self.cache
            .hset_with_expiry(
                &Self::token_key(user_id),
                device.as_str(),
                &token,
                self.token_ttl,
            )
            .await?;

        debug!("Session issued");
        let _ = self
            .events
            .publish(DomainEvent::session_issued(user_id, device.as_str()))
            .await;

        Ok(Credentials {
            user_id,
            device,
            token,
        })
    }

    /// Check presented credentials against the stored token.
    ///
    /// Fails closed: a missing entry, a different token and an unreachable
    /// store all yield `NotLoggedIn`.
    pub async fn verify(&self, credentials: &Credentials) -> Result<()> {
        let Credentials {
            user_id, device, ..
        } = *credentials;

        let stored = self
            .cache
            .hget(&Self::token_key(user_id), device.as_str())
            .await
            .map_err(|e| {
                warn!(user_id = %user_id, error = %e, "Session store unavailable");
                deny(user_id, device, DenialReason::StoreUnavailable)
            })?;

        match stored {
            None => Err(deny(user_id, device, DenialReason::NoSession)),
            Some(stored) if !tokens_match(&credentials.token, &stored) => {
                Err(deny(user_id, device, DenialReason::TokenMismatch))
            }
            Some(_) => Ok(()),
        }
    }

    /// Delete the token for `device`. Returns false if none was stored.
    pub async fn revoke(&self, user_id: UserId, device: DeviceClass, reason: &str) -> Result<bool> {
        let removed = self
            .cache
            .hdel(&Self::token_key(user_id), device.as_str())
            .await?;

        if removed {
            let _ = self
                .events
                .publish(DomainEvent::session_revoked(user_id, device.as_str(), reason))
                .await;
        }
        Ok(removed)
    }

    pub async fn current_token(&self, user_id: UserId, device: DeviceClass) -> Result<Option<String>> {
        self.cache
            .hget(&Self::token_key(user_id), device.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::InMemoryFastCache;
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn registry() -> (Arc<InMemoryFastCache>, SessionRegistry) {
        let cache = Arc::new(InMemoryFastCache::new());
        let registry = SessionRegistry::new(
            cache.clone(),
            Duration::from_secs(24 * 3600),
            Arc::new(InMemoryEventCollector::new()),
        );
        (cache, registry)
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let (cache, registry) = registry();
        let creds = registry.issue(UserId::new(1), DeviceClass::Pc).await.unwrap();

        assert_eq!(creds.token.len(), 32);
        registry.verify(&creds).await.unwrap();
        assert!(cache.ttl("user_tokens:1").await.unwrap().has_expiry());
    }

    #[tokio::test]
    async fn test_devices_are_independent() {
        let (_cache, registry) = registry();
        let pc = registry.issue(UserId::new(1), DeviceClass::Pc).await.unwrap();
        let phone = registry.issue(UserId::new(1), DeviceClass::Mobile).await.unwrap();

        registry.verify(&pc).await.unwrap();
        registry.verify(&phone).await.unwrap();

        // A PC token presented from a phone does not match the phone slot
        let crossed = Credentials {
            device: DeviceClass::Mobile,
            ..pc.clone()
        };
        assert_matches!(registry.verify(&crossed).await, Err(Error::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_revoke_and_unavailable_store_fail_closed() {
        let (cache, registry) = registry();
        let creds = registry.issue(UserId::new(2), DeviceClass::Tablet).await.unwrap();

        assert!(registry.revoke(UserId::new(2), DeviceClass::Tablet, "logout").await.unwrap());
        assert!(!registry.revoke(UserId::new(2), DeviceClass::Tablet, "logout").await.unwrap());
        assert_matches!(registry.verify(&creds).await, Err(Error::NotLoggedIn));

        let creds = registry.issue(UserId::new(2), DeviceClass::Tablet).await.unwrap();
        cache.set_available(false);
        assert_matches!(registry.verify(&creds).await, Err(Error::NotLoggedIn));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
    }
}
