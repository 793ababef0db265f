//! OAuth bearer tokens for Vertex AI and Cloud Storage.
//!
//! Resolution order mirrors the deployment surface: a static
//! `GOOGLE_ACCESS_TOKEN` override for local development, otherwise the GCE
//! metadata server that Cloud Run exposes to the service account. Metadata
//! tokens are cached until shortly before expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::GenAiError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Shared, cloneable token source.
#[derive(Clone)]
pub struct TokenProvider {
    http: reqwest::Client,
    override_token: Option<String>,
    cached: Arc<RwLock<Option<CachedToken>>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, override_token: Option<String>) -> Self {
        Self {
            http,
            override_token,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Current bearer token, fetching from the metadata server on a cache
    /// miss.
    pub async fn bearer_token(&self) -> Result<String, GenAiError> {
        if let Some(token) = &self.override_token {
            return Ok(token.clone());
        }

        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let fetched = self.fetch_metadata_token().await?;
        let token = fetched.token.clone();
        *self.cached.write().await = Some(fetched);
        Ok(token)
    }

    async fn fetch_metadata_token(&self) -> Result<CachedToken, GenAiError> {
        debug!("Fetching access token from metadata server");
        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GenAiError::Auth(format!("metadata server unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(GenAiError::Auth(format!(
                "metadata server returned HTTP {}",
                resp.status().as_u16()
            )));
        }

        let token: MetadataToken = resp
            .json()
            .await
            .map_err(|e| GenAiError::Auth(format!("invalid metadata token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}
