//! Core account types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque account identifier assigned by the credential feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AccountId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identity of one supervised account: (service, account id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub service_name: String,
    pub account_id: AccountId,
}

impl AccountKey {
    pub fn new(service_name: impl Into<String>, account_id: impl Into<AccountId>) -> Self {
        Self {
            service_name: service_name.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.account_id)
    }
}

/// Authentication problem reported alongside a set of credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AuthFault {
    /// Credentials were rejected outright.
    AuthFailed(String),
    /// The access token needs refreshing.
    TokenExpired,
}

impl AuthFault {
    pub fn is_token_expired(&self) -> bool {
        matches!(self, Self::TokenExpired)
    }
}

impl fmt::Display for AuthFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFault::AuthFailed(msg) => write!(f, "authentication failed: {}", msg),
            AuthFault::TokenExpired => write!(f, "token expired"),
        }
    }
}

/// Credential payload. Opaque to the scheduler; only pollers read it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthTokens {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token_secret: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_name: String,
}

/// Authentication state of one account at a point in time.
///
/// The feed supersedes these wholesale; nothing downstream edits a delivered
/// value except the owning supervisor's private copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub account_id: AccountId,
    pub service_name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuthFault>,
    #[serde(default)]
    pub auth: AuthTokens,
}

impl AccountCredentials {
    /// Enabled credentials without a fault.
    pub fn enabled(
        service_name: impl Into<String>,
        account_id: impl Into<AccountId>,
        auth: AuthTokens,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            service_name: service_name.into(),
            enabled: true,
            error: None,
            auth,
        }
    }

    /// The event the feed emits when an account is disabled or removed.
    pub fn disabled(service_name: impl Into<String>, account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            service_name: service_name.into(),
            enabled: false,
            error: None,
            auth: AuthTokens::default(),
        }
    }

    pub fn with_error(mut self, fault: AuthFault) -> Self {
        self.error = Some(fault);
        self
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.service_name.clone(), self.account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = AccountKey::new("google-caldav", 7);
        assert_eq!(key.to_string(), "google-caldav/7");
    }

    #[test]
    fn test_credentials_wire_format() {
        let json = r#"{
            "account_id": 12,
            "service_name": "dekko.dekkoproject_dekko",
            "enabled": true,
            "error": {"kind": "token_expired"},
            "auth": {"accessToken": "abc", "clientId": "id"}
        }"#;
        let creds: AccountCredentials = serde_json::from_str(json).unwrap();

        assert_eq!(creds.account_id, AccountId(12));
        assert_eq!(creds.error, Some(AuthFault::TokenExpired));
        assert_eq!(creds.auth.access_token, "abc");
        assert!(creds.auth.token_secret.is_empty());
        assert_eq!(creds.key(), AccountKey::new("dekko.dekkoproject_dekko", 12));
    }

    #[test]
    fn test_auth_failed_carries_message() {
        let fault: AuthFault =
            serde_json::from_str(r#"{"kind": "auth_failed", "message": "bad password"}"#).unwrap();
        assert_eq!(fault, AuthFault::AuthFailed("bad password".to_string()));
        assert!(!fault.is_token_expired());
    }

    #[test]
    fn test_disabled_event_has_no_payload() {
        let creds: AccountCredentials =
            serde_json::from_str(r#"{"account_id": 3, "service_name": "x", "enabled": false}"#)
                .unwrap();
        assert_eq!(creds, AccountCredentials::disabled("x", 3));
    }
}
