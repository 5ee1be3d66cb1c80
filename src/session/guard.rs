//! Request gate composing the address blacklist, the token registry, the
//! account role and the request budget.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::{
    deny, AbuseThrottle, Blacklist, Credentials, DenialReason, DeviceClass, SessionRegistry,
};
use crate::domain::ports::{AccountStore, UserId};
use crate::error::Result;

/// Whether an endpoint counts against the request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Standard,
    /// Budgeted; exceeding the budget suspends the account
    Sensitive,
}

pub struct AccessGuard {
    sessions: Arc<SessionRegistry>,
    throttle: AbuseThrottle,
    accounts: Arc<dyn AccountStore>,
    blacklist: Arc<Blacklist>,
}

impl AccessGuard {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        throttle: AbuseThrottle,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            sessions,
            throttle,
            accounts,
            blacklist: Arc::new(Blacklist::new()),
        }
    }

    /// Share a blacklist that is reloaded elsewhere.
    pub fn with_blacklist(mut self, blacklist: Arc<Blacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    fn check_client(&self, client: IpAddr, user_id: UserId, device: DeviceClass) -> Result<()> {
        if self.blacklist.contains(client) {
            return Err(deny(user_id, device, DenialReason::Blacklisted));
        }
        Ok(())
    }

    /// Issue a token after checking the account exists and is not suspended.
    #[instrument(skip(self), fields(user_id = %user_id, device = %device))]
    pub async fn login(&self, user_id: UserId, device: DeviceClass) -> Result<Credentials> {
        let role = self
            .accounts
            .get_role(user_id)
            .await
            .map_err(|_| deny(user_id, device, DenialReason::StoreUnavailable))?;

        match role {
            None => Err(deny(user_id, device, DenialReason::UnknownUser)),
            Some(role) if role.is_banned() => Err(deny(user_id, device, DenialReason::Suspended)),
            Some(_) => {
                let credentials = self.sessions.issue(user_id, device).await?;
                info!("User logged in");
                Ok(credentials)
            }
        }
    }

    /// `login` for a request from `client`, refused outright when blacklisted.
    #[instrument(skip(self), fields(client = %client, user_id = %user_id))]
    pub async fn login_from(
        &self,
        client: IpAddr,
        user_id: UserId,
        device: DeviceClass,
    ) -> Result<Credentials> {
        self.check_client(client, user_id, device)?;
        self.login(user_id, device).await
    }

    pub async fn login_with_user_agent(&self, user_id: UserId, user_agent: &str) -> Result<Credentials> {
        self.login(user_id, DeviceClass::from_user_agent(user_agent))
            .await
    }

    /// Admit or refuse one request.
    pub async fn authorize(
        &self,
        credentials: &Credentials,
        sensitivity: Sensitivity,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.sessions.verify(credentials).await?;

        if sensitivity == Sensitivity::Sensitive {
            self.throttle.check(credentials, now).await?;
        }
        Ok(())
    }

    /// `authorize` for a request from `client`. The blacklist is consulted
    /// before the token, so a blacklisted client never touches the stores.
    #[instrument(
        skip(self, credentials),
        fields(client = %client, user_id = %credentials.user_id)
    )]
    pub async fn authorize_from(
        &self,
        client: IpAddr,
        credentials: &Credentials,
        sensitivity: Sensitivity,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_client(client, credentials.user_id, credentials.device)?;
        self.authorize(credentials, sensitivity, now).await
    }

    /// Revoke the presenting device's token. Other devices stay logged in.
    pub async fn logout(&self, credentials: &Credentials) -> Result<()> {
        self.sessions.verify(credentials).await?;
        self.sessions
            .revoke(credentials.user_id, credentials.device, "logout")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{InMemoryAccountStore, InMemoryFastCache};
    use crate::domain::ports::UserRole;
    use crate::error::Error;
    use crate::session::ThrottlePolicy;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn guard(accounts: Arc<InMemoryAccountStore>) -> AccessGuard {
        let cache = Arc::new(InMemoryFastCache::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let sessions = Arc::new(SessionRegistry::new(
            cache.clone(),
            Duration::from_secs(3600),
            events.clone(),
        ));
        let throttle = AbuseThrottle::new(
            cache,
            accounts.clone(),
            sessions.clone(),
            ThrottlePolicy::default(),
            events,
        );
        AccessGuard::new(sessions, throttle, accounts)
    }

    #[tokio::test]
    async fn test_login_refuses_banned_and_unknown() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.insert(UserId::new(1), UserRole::User);
        accounts.insert(UserId::new(2), UserRole::Ban);
        let guard = guard(accounts.clone());

        tokio_test::assert_ok!(guard.login(UserId::new(1), DeviceClass::Pc).await);
        assert_matches!(guard.login(UserId::new(2), DeviceClass::Pc).await, Err(Error::NotLoggedIn));
        assert_matches!(guard.login(UserId::new(3), DeviceClass::Pc).await, Err(Error::NotLoggedIn));

        accounts.set_available(false);
        assert_matches!(guard.login(UserId::new(1), DeviceClass::Pc).await, Err(Error::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_logout_only_affects_one_device() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.insert(UserId::new(1), UserRole::User);
        let guard = guard(accounts);

        let pc = guard.login(UserId::new(1), DeviceClass::Pc).await.unwrap();
        let tablet = guard
            .login_with_user_agent(UserId::new(1), "Mozilla/5.0 (iPad; CPU OS 17_0)")
            .await
            .unwrap();
        assert_eq!(tablet.device, DeviceClass::Tablet);

        guard.logout(&pc).await.unwrap();
        let now = Utc::now();
        assert_matches!(
            guard.authorize(&pc, Sensitivity::Standard, now).await,
            Err(Error::NotLoggedIn)
        );
        tokio_test::assert_ok!(guard.authorize(&tablet, Sensitivity::Sensitive, now).await);
    }

    #[tokio::test]
    async fn test_blacklisted_client_is_refused_before_token_check() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.insert(UserId::new(1), UserRole::User);
        let blacklist = Arc::new(Blacklist::new());
        let guard = guard(accounts).with_blacklist(blacklist.clone());

        let bad: IpAddr = "198.51.100.4".parse().unwrap();
        let good: IpAddr = "198.51.100.5".parse().unwrap();
        let creds = guard.login_from(good, UserId::new(1), DeviceClass::Pc).await.unwrap();

        blacklist.reload_from_str("198.51.100.4");
        assert_matches!(
            guard.login_from(bad, UserId::new(1), DeviceClass::Pc).await,
            Err(Error::NotLoggedIn)
        );

        // A valid token does not help
        let now = Utc::now();
        assert_matches!(
            guard.authorize_from(bad, &creds, Sensitivity::Sensitive, now).await,
            Err(Error::NotLoggedIn)
        );
        tokio_test::assert_ok!(
            guard.authorize_from(good, &creds, Sensitivity::Standard, now).await
        );

        // Reload lifts the block
        blacklist.reload_from_str("");
        tokio_test::assert_ok!(
            guard.authorize_from(bad, &creds, Sensitivity::Standard, now).await
        );
    }

    #[tokio::test]
    async fn test_relogin_invalidates_previous_token() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.insert(UserId::new(1), UserRole::User);
        let guard = guard(accounts);

        let first = guard.login(UserId::new(1), DeviceClass::Mobile).await.unwrap();
        let second = guard.login(UserId::new(1), DeviceClass::Mobile).await.unwrap();

        let now = Utc::now();
        assert_matches!(
            guard.authorize(&first, Sensitivity::Standard, now).await,
            Err(Error::NotLoggedIn)
        );
        guard.authorize(&second, Sensitivity::Standard, now).await.unwrap();
    }
}
