use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::CompletionNotification;
use crate::infrastructure::auth::{AuthService, CallerRole};
use crate::infrastructure::config::env_or;

pub const TRANSACTION_PROCESSED_PATH: &str = "/api/worker-notifications/transaction-processed";

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Bearer token presented to the receiving side. When absent the worker
    /// mints its own from its JWT secret.
    pub service_token: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(10),
            service_token: None,
        }
    }
}

impl CallbackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CALLBACK_BASE_URL").unwrap_or(defaults.base_url),
            timeout: Duration::from_secs(env_or(
                "CALLBACK_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
            service_token: std::env::var("CALLBACK_SERVICE_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        }
    }
}

/// Outbound half of the completion callback. Only transaction
/// post-processing reports back; the job consumers record their outcome on
/// the job itself.
#[async_trait]
pub trait CompletionCallbackTrait: Send + Sync {
    async fn notify(&self, notification: &CompletionNotification) -> Result<()>;
}

pub const WORKER_SUBJECT: &str = "ledger-worker";

/// Minted tokens are replaced this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Where the bearer token for a callback comes from.
pub enum CallbackCredentials {
    /// A configured token, sent as is.
    Static(String),
    /// Tokens minted from the worker's own secret and refreshed before
    /// they expire.
    Minted(Arc<AuthService>),
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct HttpCompletionClient {
    client: Client,
    endpoint: String,
    credentials: CallbackCredentials,
    cached: RwLock<Option<CachedToken>>,
}

impl HttpCompletionClient {
    pub fn new(config: &CallbackConfig, credentials: CallbackCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                TRANSACTION_PROCESSED_PATH
            ),
            credentials,
            cached: RwLock::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String> {
        let auth = match &self.credentials {
            CallbackCredentials::Static(token) => return Ok(token.clone()),
            CallbackCredentials::Minted(auth) => auth,
        };

        let fresh_until = Utc::now() + ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.expires_at > fresh_until {
                return Ok(cached.token.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(current) = cached.as_ref() {
            if current.expires_at > fresh_until {
                return Ok(current.token.clone());
            }
        }
        let issued_at = Utc::now();
        let token = auth
            .issue_service_token(WORKER_SUBJECT, CallerRole::Worker)
            .context("Failed to mint callback token")?;
        debug!("Minted a new callback token");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: issued_at + ChronoDuration::seconds(auth.token_expiry_secs()),
        });
        Ok(token)
    }

    async fn forget_token(&self) {
        if matches!(self.credentials, CallbackCredentials::Minted(_)) {
            *self.cached.write().await = None;
        }
    }
}

#[async_trait]
impl CompletionCallbackTrait for HttpCompletionClient {
    async fn notify(&self, notification: &CompletionNotification) -> Result<()> {
        let token = self.bearer_token().await?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&token)
            .json(notification)
            .send()
            .await
            .with_context(|| format!("Completion callback to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                self.forget_token().await;
            }
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Completion callback for aggregate {} returned {}: {}",
                notification.aggregate_id, status, body
            );
            anyhow::bail!("Completion callback returned {}", status);
        }

        debug!(
            "Completion callback delivered for aggregate {}",
            notification.aggregate_id
        );
        Ok(())
    }
}
