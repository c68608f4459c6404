//! Client-credentials authentication and token refresh

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::IngestionError;
use crate::Result;

/// Fraction of the token lifetime after which it is refreshed
const REFRESH_FRACTION: f64 = 0.8;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub(crate) fn auth_params(&self) -> Value {
        json!({
            "grant_type": "client_credentials",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
}

impl AuthToken {
    pub fn from_result(result: &Value) -> Result<Self> {
        let token: AuthToken = serde_json::from_value(result.clone())
            .map_err(|e| IngestionError::protocol(format!("bad auth result: {}", e)))?;
        if token.access_token.is_empty() || token.refresh_token.is_empty() {
            return Err(IngestionError::protocol("auth result without tokens"));
        }
        Ok(token)
    }

    /// Delay after issue at which the token should be refreshed
    pub fn refresh_after(&self) -> Duration {
        Duration::from_secs(self.expires_in).mul_f64(REFRESH_FRACTION)
    }

    pub(crate) fn refresh_params(&self) -> Value {
        json!({
            "grant_type": "refresh_token",
            "refresh_token": self.refresh_token,
        })
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}
