//! Identity and token validation.
//!
//! Upstream user-auth providers (OIDC, LDAP, SAML) are external
//! collaborators: the core only consumes a validated [`Identity`] through
//! the [`TokenValidator`] trait. The crate ships one concrete validator,
//! [`LocalValidator`], backed by the `auth.users` list in config, which
//! both issues and verifies the bearer tokens handed to clients.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: HashSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    roles: Vec<String>,
    exp: u64,
}

/// Implemented by anything that can turn a bearer token into an [`Identity`].
/// OIDC/LDAP/SAML providers plug in here; the core never talks to them
/// directly.
#[async_trait::async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, BrokerError>;
}

/// Issues and validates the broker's own HS256 bearer tokens, checking
/// credentials against the in-memory `auth.users` fallback list.
pub struct LocalValidator {
    secret: Vec<u8>,
    token_expiry_secs: u64,
    users: Vec<LocalUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalUser {
    pub username: String,
    pub password: String,
    pub roles: HashSet<String>,
}

impl LocalValidator {
    pub fn new(secret: impl Into<Vec<u8>>, token_expiry_secs: u64, users: Vec<LocalUser>) -> Self {
        Self {
            secret: secret.into(),
            token_expiry_secs,
            users,
        }
    }

    /// `POST /login`: exchange credentials for `{token, expires_at, user}`.
    pub fn login(&self, username: &str, password: &str) -> Result<(String, u64, Identity), BrokerError> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| BrokerError::AuthFailure("unknown user".into()))?;

        if user.password != password {
            return Err(BrokerError::AuthFailure("bad credentials".into()));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs();
        let exp = now + self.token_expiry_secs;

        let claims = Claims {
            username: user.username.clone(),
            email: None,
            roles: user.roles.iter().cloned().collect(),
            exp,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| BrokerError::ConfigError(format!("token signing failed: {e}")))?;

        let identity = Identity {
            username: user.username.clone(),
            email: None,
            roles: user.roles.clone(),
        };
        Ok((token, exp, identity))
    }
}

#[async_trait::async_trait]
impl TokenValidator for LocalValidator {
    async fn validate(&self, token: &str) -> Result<Identity, BrokerError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Validation::default(),
        )
        .map_err(|e| BrokerError::AuthFailure(format!("invalid token: {e}")))?;

        Ok(Identity {
            username: data.claims.username,
            email: data.claims.email,
            roles: data.claims.roles.into_iter().collect(),
        })
    }
}
