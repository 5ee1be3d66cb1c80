//! Session & Abuse Control
//!
//! Per-device login tokens, a per-user request budget on sensitive
//! endpoints, a client address blacklist and the sign-in calendar.
//!
//! Every authorization failure reaches the caller as the same
//! [`Error::NotLoggedIn`]; the actual [`DenialReason`] only shows up in logs,
//! metrics and audit events.

pub mod blacklist;
pub mod device;
pub mod guard;
pub mod registry;
pub mod signin;
pub mod throttle;

use tracing::warn;

use crate::domain::ports::UserId;
use crate::error::Error;
use crate::metrics::AUTH_DENIALS;

pub use blacklist::Blacklist;
pub use device::DeviceClass;
pub use guard::{AccessGuard, Sensitivity};
pub use registry::{Credentials, SessionRegistry};
pub use signin::{next_set_bit, SignInCalendar};
pub use throttle::{AbuseThrottle, ThrottlePolicy};

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// No token stored for the device
    NoSession,
    /// Presented token differs from the stored one
    TokenMismatch,
    /// Account role is `ban`
    Suspended,
    /// Request budget exceeded on this request
    BudgetExceeded,
    /// User row does not exist
    UnknownUser,
    /// Session or account store could not be reached
    StoreUnavailable,
    /// Client address is blacklisted
    Blacklisted,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NoSession => "no_session",
            DenialReason::TokenMismatch => "token_mismatch",
            DenialReason::Suspended => "suspended",
            DenialReason::BudgetExceeded => "budget_exceeded",
            DenialReason::UnknownUser => "unknown_user",
            DenialReason::StoreUnavailable => "store_unavailable",
            DenialReason::Blacklisted => "blacklisted",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record a denial and produce the generic error.
pub(crate) fn deny(user_id: UserId, device: DeviceClass, reason: DenialReason) -> Error {
    AUTH_DENIALS.with_label_values(&[reason.as_str()]).inc();
    warn!(user_id = %user_id, device = %device, reason = %reason, "Request denied");
    Error::NotLoggedIn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_denial_is_the_same_error() {
        for reason in [
            DenialReason::NoSession,
            DenialReason::TokenMismatch,
            DenialReason::Suspended,
            DenialReason::BudgetExceeded,
            DenialReason::UnknownUser,
            DenialReason::StoreUnavailable,
            DenialReason::Blacklisted,
        ] {
            let err = deny(UserId::new(1), DeviceClass::Pc, reason);
            assert_eq!(err.to_string(), "not logged in");
        }
    }
}
