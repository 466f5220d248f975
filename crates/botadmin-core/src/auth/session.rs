use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh pair issued together by the login and refresh endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair").finish_non_exhaustive()
    }
}

/// Role of an administrator account. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Superadmin,
    Admin,
    Viewer,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Role::Superadmin => "superadmin",
            Role::Admin => "admin",
            Role::Viewer => "viewer",
            Role::Unknown => "unknown",
        };
        write!(f, "{value}")
    }
}

/// The authenticated administrator as reported by `GET /auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    #[serde(default, with = "timestamp::option")]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the process-wide session.
///
/// `is_authenticated` is kept in step with `access_token` by the credential store; it is
/// serialized so the persisted layout carries the flag alongside the tokens.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub principal: Option<Principal>,
    #[serde(default)]
    pub is_authenticated: bool,
}

impl Session {
    pub fn authenticated(tokens: TokenPair, principal: Option<Principal>) -> Self {
        Self {
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            principal,
            is_authenticated: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.principal.is_none()
    }

    /// Restore the flag from the token so a stale persisted value cannot contradict it.
    pub(crate) fn normalized(mut self) -> Self {
        self.is_authenticated = self.access_token.is_some();
        if !self.is_authenticated {
            self.refresh_token = None;
            self.principal = None;
        }
        self
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("principal", &self.principal)
            .field("is_authenticated", &self.is_authenticated)
            .finish()
    }
}

/// Backend timestamps come either as RFC 3339 or as naive ISO-8601 in UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => super::serialize(ts, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'"))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn principal_accepts_naive_and_offset_timestamps() {
        let principal: Principal = serde_json::from_value(serde_json::json!({
            "id": 1,
            "username": "admin",
            "role": "superadmin",
            "is_active": true,
            "last_login_at": "2024-05-01T10:00:00+02:00",
            "created_at": "2024-01-01T00:00:00.123456"
        }))
        .unwrap();
        assert_eq!(principal.role, Role::Superadmin);
        assert_eq!(
            principal.last_login_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(principal.created_at.timestamp(), 1_704_067_200);
    }

    #[test]
    fn principal_tolerates_unknown_role_and_missing_login() {
        let principal: Principal = serde_json::from_value(serde_json::json!({
            "id": 2,
            "username": "ops",
            "role": "auditor",
            "is_active": false,
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(principal.role, Role::Unknown);
        assert!(principal.last_login_at.is_none());
    }

    #[test]
    fn normalized_derives_flag_from_token() {
        let stale = Session {
            access_token: None,
            refresh_token: Some("R1".into()),
            principal: None,
            is_authenticated: true,
        };
        assert_eq!(stale.normalized(), Session::default());

        let mut session = Session::authenticated(TokenPair::new("A1", "R1"), None);
        session.is_authenticated = false;
        assert!(session.normalized().is_authenticated);
    }

    #[test]
    fn debug_output_hides_tokens() {
        let session = Session::authenticated(TokenPair::new("secret-a", "secret-r"), None);
        let printed = format!("{session:?} {:?}", TokenPair::new("secret-a", "secret-r"));
        assert!(!printed.contains("secret"));
    }
}
