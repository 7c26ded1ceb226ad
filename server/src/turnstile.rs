use std::time::Duration;

use serde::Deserialize;

const SITEVERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Verdict from the challenge verifier.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyOutcome {
    pub success: bool,
    #[serde(default)]
    pub challenge_ts: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, rename = "error-codes")]
    pub error_codes: Vec<String>,
}

/// Client for the Cloudflare Turnstile siteverify endpoint. Transport
/// errors and timeouts are surfaced as `Err`; callers treat them as a
/// failed verification.
pub struct TurnstileClient {
    secret: String,
    base_url: String,
    http: reqwest::Client,
}

impl TurnstileClient {
    pub fn new(secret: String) -> Self {
        Self::with_base_url(secret, SITEVERIFY_URL.to_string())
    }

    /// Point the client at a different endpoint. Tests use this to talk
    /// to a local stand-in.
    pub fn with_base_url(secret: String, base_url: String) -> Self {
        Self {
            secret,
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn verify(&self, token: &str, remote_ip: &str) -> Result<VerifyOutcome, reqwest::Error> {
        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if !remote_ip.is_empty() {
            form.push(("remoteip", remote_ip));
        }

        let response = self
            .http
            .post(&self.base_url)
            .timeout(VERIFY_TIMEOUT)
            .form(&form)
            .send()
            .await?;

        response.json::<VerifyOutcome>().await
    }
}
