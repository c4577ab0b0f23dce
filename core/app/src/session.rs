//! Admin session with a fixed lifetime.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sehatlink_common::{Error, Result};

/// A logged-in admin session.
///
/// The session is valid for `ttl` after `login_time`. Writes made through a
/// service with an expired session attached are refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: String,
    pub login_time: DateTime<Utc>,
    #[serde(with = "ttl_seconds")]
    pub ttl: Duration,
}

mod ttl_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ttl.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("ttl of {} seconds is out of range", secs)))
    }
}

impl Session {
    pub fn new(user: impl Into<String>, ttl: Duration) -> Self {
        Self::started_at(user, Utc::now(), ttl)
    }

    pub fn started_at(user: impl Into<String>, login_time: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            user: user.into(),
            login_time,
            ttl,
        }
    }

    /// End of the session. A lifetime past the calendar's end never expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.login_time
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// # Errors
    /// - `SessionExpired` once the session is older than its ttl
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_valid_at(now) {
            Ok(())
        } else {
            Err(Error::SessionExpired(format!(
                "session for '{}' expired at {}",
                self.user,
                self.expires_at().to_rfc3339()
            )))
        }
    }

    /// Restart the session's lifetime from `now`.
    pub fn refresh_at(&mut self, now: DateTime<Utc>) {
        self.login_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let login = Utc::now();
        let session = Session::started_at("admin", login, Duration::hours(24));

        assert!(session.is_valid_at(login + Duration::hours(23)));
        assert!(!session.is_valid_at(login + Duration::hours(24)));
        assert!(matches!(
            session.ensure_valid_at(login + Duration::hours(25)),
            Err(Error::SessionExpired(_))
        ));
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let login = Utc::now() - Duration::hours(30);
        let mut session = Session::started_at("admin", login, Duration::hours(24));
        assert!(!session.is_valid());

        session.refresh_at(Utc::now());
        assert!(session.is_valid());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let session = Session::new("admin", Duration::hours(10_000_000_000));
        assert_eq!(session.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(session.is_valid());
        assert!(session.ensure_valid_at(Utc::now()).is_ok());

        let result: std::result::Result<Session, _> = serde_json::from_value(serde_json::json!({
            "user": "admin",
            "loginTime": "2024-01-01T00:00:00Z",
            "ttl": i64::MAX
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_ttl_in_seconds() {
        let session = Session::new("admin", Duration::hours(1));
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["ttl"], 3600);

        let back: Session = serde_json::from_value(value).unwrap();
        assert_eq!(back.ttl, Duration::hours(1));
    }
}
