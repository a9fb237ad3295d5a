//! Token validation against the external auth API.
//!
//! The validator is consulted once per agent session, during the handshake.
//! Every failure mode (missing endpoint, network error, malformed body)
//! collapses to "invalid": a misconfigured ingress rejects all agents rather
//! than admitting them.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the environment variable carrying the validation endpoint.
pub const VALIDATE_URL_ENV: &str = "API_VALIDATE_URL";

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenValidator {
    url: Option<String>,
    client: reqwest::Client,
}

impl TokenValidator {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("default reqwest client");
        Self { url, client }
    }

    /// Reads the endpoint from `API_VALIDATE_URL`.
    pub fn from_env() -> Self {
        Self::new(std::env::var(VALIDATE_URL_ENV).ok(), DEFAULT_TIMEOUT)
    }

    /// POSTs `{"key": token}` and returns true iff the endpoint answered
    /// `{"valid": true}`.
    pub async fn is_valid(&self, token: &str) -> bool {
        let Some(url) = self.url.as_deref() else {
            warn!("{VALIDATE_URL_ENV} is not set; rejecting token");
            return false;
        };
        let payload = serde_json::json!({ "key": token });
        let result = async {
            self.client
                .post(url)
                .json(&payload)
                .send()
                .await?
                .json::<ValidateResponse>()
                .await
        }
        .await;
        match result {
            Ok(resp) => {
                debug!(
                    valid = resp.valid,
                    error = resp.error.as_deref(),
                    user = resp.user_id.as_deref(),
                    "validator response"
                );
                resp.valid
            }
            Err(err) => {
                warn!("token validation call failed: {err}");
                false
            }
        }
    }
}
