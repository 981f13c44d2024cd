use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// Default safety margin before expiry at which a credential stops being
/// handed out. Covers clock skew and the request's own time in flight.
pub const DEFAULT_EXPIRY_MARGIN_SECS: i64 = 30;

/// Upper bound on a server-declared lifetime (10 years). Anything larger is
/// nonsense from the backend and would overflow date arithmetic.
const MAX_EXPIRES_IN_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// In-memory bearer credential.
///
/// Never persisted: a restarted client always exchanges its refresh token
/// for a fresh credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    issued_at: DateTime<Utc>,
    expires_in: i64,
}

impl Credential {
    /// Credential obtained just now with the given server-declared lifetime
    pub fn new(access_token: impl Into<String>, expires_in: i64) -> Self {
        Self::issued_at(access_token, expires_in, Utc::now())
    }

    pub fn issued_at(
        access_token: impl Into<String>,
        expires_in: i64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            issued_at,
            expires_in: expires_in.clamp(0, MAX_EXPIRES_IN_SECS),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.expires_in)
    }

    /// Valid iff `now < issued_at + expires_in - margin`.
    ///
    /// The margin never exceeds half the lifetime, so a short-lived token is
    /// still used for part of it instead of forcing a refresh on every call.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = margin.min(Duration::seconds(self.expires_in / 2));
        match self.expires_at().checked_sub_signed(margin) {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    pub fn is_valid(&self, margin: Duration) -> bool {
        self.is_valid_at(Utc::now(), margin)
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at() - Utc::now()
    }

    /// Seconds remaining until expiry (for display)
    pub fn seconds_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_seconds().max(0)
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}
