//! Bearer-token acquisition for authenticated event-stream backends.
//!
//! Tokens are fetched lazily with a client-credentials exchange, cached, and
//! refreshed once the cached token is inside the configured expiry window.
//! A 401 from the backend invalidates the cache so the next acquisition
//! fetches a fresh token.

use std::time::{SystemTime, UNIX_EPOCH};

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::sync::RwLock,
    tracing::{debug, info},
};

use crate::{
    config::TokenConfig,
    error::{Context, Error, Result},
};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: Secret<String>,
    /// Unix seconds; `None` means the issuer reported no expiry.
    expires_at: Option<u64>,
}

pub struct TokenProvider {
    config: TokenConfig,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(config: TokenConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            cached: RwLock::new(None),
        }
    }

    /// Return a bearer token, fetching or refreshing as needed.
    pub async fn bearer(&self) -> Result<Secret<String>> {
        {
            let cached = self.cached.read().await;
            if let Some(tok) = cached.as_ref()
                && !self.is_expiring(tok)
            {
                return Ok(tok.token.clone());
            }
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *self.cached.write().await = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token (called after a 401 so the retry re-fetches).
    pub async fn invalidate(&self) {
        debug!(token_url = %self.config.token_url, "invalidating cached bearer token");
        *self.cached.write().await = None;
    }

    fn is_expiring(&self, token: &CachedToken) -> bool {
        let Some(expires_at) = token.expires_at else {
            return false;
        };
        now_secs() + self.config.refresh_window_secs >= expires_at
    }

    async fn fetch(&self) -> Result<CachedToken> {
        debug!(token_url = %self.config.token_url, "fetching bearer token");

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
        ];
        if let Some(scope) = &self.config.scope {
            form.push(("scope", scope.clone()));
        }

        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Protocol(format!(
                "token endpoint returned HTTP {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .context("failed to parse token endpoint response")?;
        let expires_at = body.expires_in.map(|secs| now_secs() + secs);

        info!(token_url = %self.config.token_url, "bearer token acquired");

        Ok(CachedToken {
            token: Secret::new(body.access_token),
            expires_at,
        })
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
