//! Per-user request budget on sensitive endpoints.
//!
//! Each request increments `user:{id}:time:{minute_of_day}`. The counter is
//! created with a short expiry, so a burst is measured against the minute it
//! started in. The request that pushes the counter over the limit suspends
//! the account and logs out the device it came from.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

use super::{deny, Credentials, DenialReason, SessionRegistry};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{AccountStore, EventPublisher, FastCache, UserId, UserRole};
use crate::error::{Error, Result};
use crate::metrics::ACCOUNTS_SUSPENDED;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    /// Requests allowed per counter before suspension
    pub max_requests: i64,
    /// Lifetime of a counter key, set when it is created
    pub counter_ttl_secs: u64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_requests: 20,
            counter_ttl_secs: 180,
        }
    }
}

impl ThrottlePolicy {
    pub fn counter_key(user_id: UserId, now: DateTime<Utc>) -> String {
        let minute_of_day = now.hour() * 60 + now.minute();
        format!("user:{}:time:{}", user_id, minute_of_day)
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests < 1 {
            return Err(Error::Config(
                "throttle.max_requests must be at least 1".to_string(),
            ));
        }
        if self.counter_ttl_secs == 0 {
            return Err(Error::Config(
                "throttle.counter_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct AbuseThrottle {
    cache: Arc<dyn FastCache>,
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<SessionRegistry>,
    policy: ThrottlePolicy,
    events: Arc<dyn EventPublisher>,
}

impl AbuseThrottle {
    pub fn new(
        cache: Arc<dyn FastCache>,
        accounts: Arc<dyn AccountStore>,
        sessions: Arc<SessionRegistry>,
        policy: ThrottlePolicy,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            accounts,
            sessions,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Count one sensitive request. Returns the counter value when the
    /// request is within budget.
    #[instrument(skip(self, credentials), fields(user_id = %credentials.user_id))]
    pub async fn check(&self, credentials: &Credentials, now: DateTime<Utc>) -> Result<i64> {
        let Credentials {
            user_id, device, ..
        } = *credentials;
        let key = ThrottlePolicy::counter_key(user_id, now);

        let count = match self
            .cache
            .incr_with_expiry(&key, self.policy.counter_ttl())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Request counter unavailable");
                return Err(deny(user_id, device, DenialReason::StoreUnavailable));
            }
        };

        if count > self.policy.max_requests {
            self.suspend(credentials, count).await;
            return Err(deny(user_id, device, DenialReason::BudgetExceeded));
        }

        Ok(count)
    }

    async fn suspend(&self, credentials: &Credentials, count: i64) {
        let user_id = credentials.user_id;

        match self.accounts.set_role(user_id, UserRole::Ban).await {
            Ok(true) => {}
            Ok(false) => warn!(user_id = %user_id, "No account row to suspend"),
            Err(e) => error!(user_id = %user_id, error = %e, "Failed to persist suspension"),
        }

        if let Err(e) = self
            .sessions
            .revoke(user_id, credentials.device, "request budget exceeded")
            .await
        {
            error!(user_id = %user_id, error = %e, "Failed to revoke session");
        }

        ACCOUNTS_SUSPENDED.inc();
        let _ = self
            .events
            .publish(DomainEvent::account_suspended(user_id, count))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{InMemoryAccountStore, InMemoryFastCache};
    use crate::session::DeviceClass;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    struct Fixture {
        cache: Arc<InMemoryFastCache>,
        accounts: Arc<InMemoryAccountStore>,
        sessions: Arc<SessionRegistry>,
        events: Arc<InMemoryEventCollector>,
        throttle: AbuseThrottle,
    }

    fn fixture(max_requests: i64) -> Fixture {
        let cache = Arc::new(InMemoryFastCache::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let sessions = Arc::new(SessionRegistry::new(
            cache.clone(),
            Duration::from_secs(3600),
            events.clone(),
        ));
        let throttle = AbuseThrottle::new(
            cache.clone(),
            accounts.clone(),
            sessions.clone(),
            ThrottlePolicy {
                max_requests,
                ..Default::default()
            },
            events.clone(),
        );
        Fixture {
            cache,
            accounts,
            sessions,
            events,
            throttle,
        }
    }

    #[test]
    fn test_counter_key_uses_minute_of_day() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 13, 7, 42).unwrap();
        assert_eq!(ThrottlePolicy::counter_key(UserId::new(9), at), "user:9:time:787");
    }

    #[tokio::test]
    async fn test_over_budget_suspends_and_revokes() {
        let f = fixture(3);
        let user = UserId::new(5);
        f.accounts.insert(user, UserRole::User);
        let creds = f.sessions.issue(user, DeviceClass::Mobile).await.unwrap();
        let now = Utc::now();

        for expected in 1..=3 {
            assert_eq!(f.throttle.check(&creds, now).await.unwrap(), expected);
        }
        assert_matches!(f.throttle.check(&creds, now).await, Err(Error::NotLoggedIn));

        assert_eq!(f.accounts.get_role(user).await.unwrap(), Some(UserRole::Ban));
        assert_eq!(f.sessions.current_token(user, DeviceClass::Mobile).await.unwrap(), None);
        assert_eq!(f.events.events_of_type("AccountSuspended").len(), 1);

        let key = ThrottlePolicy::counter_key(user, now);
        assert!(f.cache.ttl(&key).await.unwrap().has_expiry());
    }

    #[tokio::test]
    async fn test_counter_failure_fails_closed() {
        let f = fixture(20);
        let creds = Credentials {
            user_id: UserId::new(1),
            device: DeviceClass::Pc,
            token: "t".to_string(),
        };
        f.cache.set_available(false);

        assert_matches!(f.throttle.check(&creds, Utc::now()).await, Err(Error::NotLoggedIn));
        assert!(f.events.is_empty());
    }

    #[test]
    fn test_policy_validation() {
        assert!(ThrottlePolicy::default().validate().is_ok());
        let bad = ThrottlePolicy {
            max_requests: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
