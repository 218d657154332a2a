use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Refresh tokens this long before expiry so a sub-request never outlives
/// its bearer token.
const TOKEN_LEEWAY_SECS: i64 = 60;

/// Authentication scheme for one provider.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    #[default]
    None,
    #[serde(rename_all = "camelCase")]
    ApiKey {
        header: String,
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Oauth2Cc {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

/// Static description of one provider, loaded once at init.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub key: String,
    pub schema_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub auth: ProviderAuth,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(TOKEN_LEEWAY_SECS) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("token endpoint failure: {0}")]
    Auth(String),
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("provider returned a non-JSON body")]
    Body,
}

/// One provider's executor: immutable descriptor plus a shared token cache.
/// Concurrent token refreshes collapse into one fetch behind the write lock.
pub struct ProviderHandle {
    pub descriptor: ProviderDescriptor,
    token: RwLock<Option<CachedToken>>,
    http: reqwest::Client,
}

impl ProviderHandle {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        let timeout = Duration::from_secs(descriptor.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            descriptor,
            token: RwLock::new(None),
            http,
        }
    }

    /// POST `body` to the provider endpoint with the descriptor's auth and
    /// return the parsed JSON response. No retries — the federator decides
    /// what a failure means.
    pub async fn dispatch(&self, body: &serde_json::Value) -> Result<serde_json::Value, DispatchError> {
        let mut request = self
            .http
            .post(&self.descriptor.endpoint)
            .header("content-type", "application/json")
            .json(body);

        match &self.descriptor.auth {
            ProviderAuth::None => {}
            ProviderAuth::ApiKey { header, value } => {
                request = request.header(header.as_str(), value.as_str());
            }
            ProviderAuth::Oauth2Cc { .. } => {
                let token = self.bearer_token().await?;
                request = request.header("authorization", format!("Bearer {token}"));
            }
        }

        let response = request
            .send()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status.as_u16()));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|_| DispatchError::Body)
    }

    /// Return a valid bearer token, refreshing through the token endpoint
    /// when the cached one is absent or inside the expiry leeway. The write
    /// lock is the single-flight guard: whoever wins refreshes, everyone
    /// else re-reads the fresh token.
    async fn bearer_token(&self) -> Result<String, DispatchError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.access_token.clone());
        }

        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedToken, DispatchError> {
        let ProviderAuth::Oauth2Cc {
            token_url,
            client_id,
            client_secret,
            scopes,
        } = &self.descriptor.auth
        else {
            return Err(DispatchError::Auth("provider has no token endpoint".into()));
        };

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.clone()),
            ("client_secret", client_secret.clone()),
        ];
        if !scopes.is_empty() {
            form.push(("scope", scopes.join(" ")));
        }

        let response = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| DispatchError::Auth(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::Auth(format!(
                "token endpoint returned status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| DispatchError::Auth(err.to_string()))?;

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in as i64),
        })
    }
}

/// Read-only registry of configured providers, built once at init.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderHandle>>,
}

impl ProviderRegistry {
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Self {
        let providers = descriptors
            .into_iter()
            .map(|descriptor| {
                (
                    descriptor.key.clone(),
                    Arc::new(ProviderHandle::new(descriptor)),
                )
            })
            .collect();
        Self { providers }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let descriptors: Vec<ProviderDescriptor> = serde_json::from_str(raw)?;
        Ok(Self::new(descriptors))
    }

    pub fn get(&self, key: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
