/// webhook.rs — Outbound rollback/alert dispatch (§4.9, §5, §6)
///
/// Retargets the teacher's `live.rs::LiveOrderClient::sign` HMAC-SHA256
/// idiom (`Hmac<Sha256>::new_from_slice(...).update(...).finalize()` →
/// `hex::encode`) from a signed Binance query string onto a signed JSON
/// body: canonical JSON bytes are HMAC'd and carried in the
/// `X-OBS-Signature` header. Retried on 5xx with exponential backoff;
/// 4xx is terminal (§6, §7).
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{error, warn};

type HmacSha256 = Hmac<Sha256>;

/// 1,2,4,8,16s backoff, max 5 attempts, per §5.
const BACKOFF_SECONDS: [u64; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Clone, Serialize)]
pub struct RollbackAlertPayload<'a> {
    pub job_id: &'a str,
    pub decision: &'a str,
    pub anomalies: &'a serde_json::Value,
    pub bars_processed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Terminal 4xx — not retried.
    Rejected,
    /// Exhausted retries against 5xx/timeout.
    Exhausted,
}

pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("HTTP client build failed"),
            url: url.into(),
            secret: secret.into(),
        }
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC key error");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// POST a JSON payload, fire-and-forget from the core's perspective:
    /// the caller gets a best-effort outcome, never a hard error that
    /// would abort the update worker (§7: "Webhook 5xx / timeout" is
    /// best-effort, "4xx is terminal").
    pub async fn post_alert(&self, payload: &RollbackAlertPayload<'_>) -> DispatchOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                error!("webhook payload serialization failed: {e}");
                return DispatchOutcome::Rejected;
            }
        };
        let signature = self.sign(&body);

        for (attempt, delay_secs) in BACKOFF_SECONDS.iter().enumerate() {
            let resp = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-OBS-Signature", &signature)
                .body(body.clone())
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => return DispatchOutcome::Delivered,
                Ok(r) if r.status().is_client_error() => {
                    warn!("webhook rejected with {}: terminal, not retrying", r.status());
                    return DispatchOutcome::Rejected;
                }
                Ok(r) => {
                    warn!("webhook attempt {} got {}; retrying", attempt + 1, r.status());
                }
                Err(e) => {
                    warn!("webhook attempt {} failed: {e}; retrying", attempt + 1);
                }
            }
            if attempt + 1 < BACKOFF_SECONDS.len() {
                tokio::time::sleep(std::time::Duration::from_secs(*delay_secs)).await;
            }
        }
        error!("webhook exhausted all {} attempts", BACKOFF_SECONDS.len());
        DispatchOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_same_body_and_secret() {
        let client = WebhookClient::new("http://example.invalid", "secret123");
        let body = br#"{"job_id":"abc"}"#;
        assert_eq!(client.sign(body), client.sign(body));
    }

    #[test]
    fn signature_changes_with_secret() {
        let a = WebhookClient::new("http://example.invalid", "secret-a");
        let b = WebhookClient::new("http://example.invalid", "secret-b");
        let body = br#"{"job_id":"abc"}"#;
        assert_ne!(a.sign(body), b.sign(body));
    }
}
