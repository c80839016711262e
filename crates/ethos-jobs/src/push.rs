//! Push delivery.
//!
//! [`WebPushGateway`] posts each [`PushMessage`] as JSON to a delivery gateway
//! that owns the browser push protocol. When a secret is configured the body
//! is signed with HMAC-SHA256 and the hex digest sent as
//! `X-Ethos-Signature: sha256=<digest>`.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use ethos_core::{defaults, Error, PushMessage, PushSender, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signature header for a request body.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid push gateway secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// HTTP push gateway client.
pub struct WebPushGateway {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebPushGateway {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }

    /// Create from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PUSH_GATEWAY_URL` | unset | Gateway endpoint; `None` when unset |
    /// | `PUSH_GATEWAY_SECRET` | unset | HMAC signing secret |
    /// | `PUSH_TIMEOUT_SECS` | `10` | Request timeout |
    pub fn from_env() -> Result<Option<Self>> {
        let Some(url) = std::env::var(defaults::ENV_PUSH_GATEWAY_URL)
            .ok()
            .filter(|v| !v.trim().is_empty())
        else {
            return Ok(None);
        };
        let secret = std::env::var(defaults::ENV_PUSH_GATEWAY_SECRET)
            .ok()
            .filter(|v| !v.is_empty());
        let timeout = std::env::var("PUSH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::PUSH_TIMEOUT_SECS);
        Self::new(url, secret, Duration::from_secs(timeout)).map(Some)
    }
}

#[async_trait]
impl PushSender for WebPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.header("X-Ethos-Signature", sign_body(secret, &body)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Push(format!("gateway returned {status}")));
        }
        debug!(brand_id = %message.brand_id, category = %message.category, "Push delivered");
        Ok(())
    }

    fn name(&self) -> &str {
        "web_push_gateway"
    }
}

/// Sender used when no gateway is configured: logs each push and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySender;

#[async_trait]
impl PushSender for LogOnlySender {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        info!(
            subsystem = "notify",
            brand_id = %message.brand_id,
            category = %message.category,
            delta = message.delta,
            "Push (no gateway configured)"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log_only"
    }
}
