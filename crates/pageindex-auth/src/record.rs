//! Credential record types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tokens returned by the identity provider.
///
/// Field names follow the OAuth 2.0 token response so a response body can be
/// deserialized directly into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Unix timestamp when the access token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Create a bearer token with no refresh token or expiry.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_in: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Stamp `expires_at` from `expires_in`, relative to `now`.
    pub fn stamped(mut self, now: u64) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| now.saturating_add(secs));
        }
        self
    }

    /// Check whether the access token expires within `skew_secs` of `now`.
    ///
    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now: u64, skew_secs: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(skew_secs),
            None => false,
        }
    }
}

/// Client identity issued by dynamic client registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    /// Registered client metadata echoed back by the provider.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl ClientInfo {
    /// Create a public client identity.
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
            metadata: Map::new(),
        }
    }

    /// Check whether the client secret has expired.
    ///
    /// A value of `0` means the secret never expires (RFC 7591).
    pub fn is_secret_expired(&self, now: u64) -> bool {
        match self.client_secret_expires_at {
            Some(0) | None => false,
            Some(expires_at) => expires_at < now,
        }
    }
}

/// Everything persisted to the credential file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
    /// PKCE verifier of the authorization attempt in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

impl CredentialRecord {
    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.client_info.is_none() && self.code_verifier.is_none()
    }

    /// Clear the fields covered by `scope`.
    pub fn invalidate(&mut self, scope: InvalidateScope) {
        match scope {
            InvalidateScope::All => *self = Self::default(),
            InvalidateScope::Client => self.client_info = None,
            InvalidateScope::Tokens => self.tokens = None,
            InvalidateScope::Verifier => self.code_verifier = None,
        }
    }
}

/// Which part of the credential record to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    All,
    Client,
    Tokens,
    Verifier,
}

impl std::fmt::Display for InvalidateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Client => "client",
            Self::Tokens => "tokens",
            Self::Verifier => "verifier",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record() -> CredentialRecord {
        CredentialRecord {
            tokens: Some(OAuthTokens::bearer("access")),
            client_info: Some(ClientInfo::public("client")),
            code_verifier: Some("verifier".to_string()),
        }
    }

    #[test]
    fn test_record_wire_format_is_camel_case() {
        let json = serde_json::to_value(full_record()).unwrap();
        assert!(json.get("tokens").is_some());
        assert!(json.get("clientInfo").is_some());
        assert_eq!(json["codeVerifier"], "verifier");
        assert_eq!(json["tokens"]["access_token"], "access");
    }

    #[test]
    fn test_empty_record_serializes_to_empty_object() {
        let json = serde_json::to_string(&CredentialRecord::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_invalidate_scopes() {
        let mut record = full_record();
        record.invalidate(InvalidateScope::Tokens);
        assert!(record.tokens.is_none());
        assert!(record.client_info.is_some());
        assert!(record.code_verifier.is_some());

        record.invalidate(InvalidateScope::Verifier);
        assert!(record.code_verifier.is_none());
        assert!(record.client_info.is_some());

        record.invalidate(InvalidateScope::Client);
        assert!(record.is_empty());

        let mut record = full_record();
        record.invalidate(InvalidateScope::All);
        assert!(record.is_empty());
    }

    #[test]
    fn test_token_expiry() {
        let tokens = OAuthTokens {
            expires_in: Some(3600),
            ..OAuthTokens::bearer("a")
        }
        .stamped(1_000);
        assert_eq!(tokens.expires_at, Some(4_600));
        assert!(!tokens.is_expired(1_000, 60));
        assert!(tokens.is_expired(4_550, 60));
        assert!(!OAuthTokens::bearer("a").is_expired(u64::MAX - 1, 60));
    }

    #[test]
    fn test_token_response_defaults() {
        let tokens: OAuthTokens =
            serde_json::from_str(r#"{"access_token": "abc", "expires_in": 60}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, Some(60));
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn test_client_info_keeps_registered_metadata() {
        let info: ClientInfo = serde_json::from_str(
            r#"{"client_id": "c1", "client_name": "PageIndex MCP", "redirect_uris": ["http://localhost:8090/callback"]}"#,
        )
        .unwrap();
        assert_eq!(info.client_id, "c1");
        assert_eq!(info.metadata["client_name"], "PageIndex MCP");

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["redirect_uris"][0], "http://localhost:8090/callback");
    }

    #[test]
    fn test_client_secret_expiry() {
        let mut info = ClientInfo::public("c");
        assert!(!info.is_secret_expired(100));
        info.client_secret_expires_at = Some(0);
        assert!(!info.is_secret_expired(100));
        info.client_secret_expires_at = Some(50);
        assert!(info.is_secret_expired(100));
    }
}
