//! Feed providers and the per-action fallback chains built from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::action::ActionType;
use crate::config::{HttpProviderConfig, ReconConfig, DEFAULT_HTTP_TIMEOUT_MS};
use crate::error::ProviderError;

pub const MOCK_PROVIDER: &str = "mock";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub action: ActionType,
    pub target: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// Opaque provider answer; `params` describes the request as the provider saw it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResponse {
    pub payload: String,
    pub params: Value,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, ProviderError>;
}

pub type SharedProvider = Arc<dyn Provider>;

/// Ordered provider list per action type.
#[derive(Clone, Default)]
pub struct ProviderChains {
    chains: HashMap<ActionType, Vec<SharedProvider>>,
}

impl ProviderChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, action: ActionType, providers: Vec<SharedProvider>) -> Self {
        self.chains.insert(action, providers);
        self
    }

    pub fn chain(&self, action: ActionType) -> &[SharedProvider] {
        self.chains.get(&action).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve configured provider names. Unknown names are skipped with a warning;
    /// the mock provider always closes each chain.
    pub fn from_config(cfg: &ReconConfig) -> Self {
        let http: HashMap<String, SharedProvider> = cfg
            .http_providers
            .iter()
            .map(|p| {
                let provider: SharedProvider = Arc::new(HttpProvider::from_config(p));
                (p.name.trim().to_ascii_lowercase(), provider)
            })
            .collect();
        let mock: SharedProvider = Arc::new(MockProvider::default());
        let mut chains = HashMap::new();
        for action in ActionType::ALL {
            let mut chain: Vec<SharedProvider> = Vec::new();
            for name in cfg.providers.chain_for(action) {
                if name == MOCK_PROVIDER {
                    chain.push(mock.clone());
                } else if let Some(p) = http.get(&name) {
                    chain.push(p.clone());
                } else {
                    tracing::warn!(
                        target: "recon::worker",
                        provider = %name,
                        action = %action,
                        "no provider registered under this name; skipping"
                    );
                }
            }
            chains.insert(action, chain);
        }
        Self { chains }
    }
}

/// Deterministic fixture feed: the same request always yields the same payload.
#[derive(Clone, Debug)]
pub struct MockProvider {
    events_per_fetch: usize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            events_per_fetch: 6,
        }
    }
}

impl MockProvider {
    pub fn new(events_per_fetch: usize) -> Self {
        Self { events_per_fetch }
    }

    fn synthesize(&self, request: &FetchRequest) -> Vec<Value> {
        let mut hasher = Sha256::new();
        hasher.update(request.action.as_str().as_bytes());
        hasher.update(request.target.as_bytes());
        hasher.update(request.since.timestamp().to_be_bytes());
        hasher.update(request.until.timestamp().to_be_bytes());
        let seed = hasher.finalize();

        let start = request.since.timestamp().max(request.until.timestamp() - 86_400);
        let span = (request.until.timestamp() - start).max(1);
        (0..self.events_per_fetch)
            .map(|i| {
                let byte = seed[i % seed.len()] as i64;
                let ts = start + 1 + (span - 1) * (i as i64 + 1) / (self.events_per_fetch as i64 + 1);
                let usd = 50.0 + (byte * 37 % 5_000) as f64;
                let tx = format!("0xmock{:02x}{:02x}{:04}", seed[0], seed[1], i);
                match request.action {
                    ActionType::WalletRecon => json!({
                        "txHash": tx,
                        "logIndex": 0,
                        "timestamp": ts,
                        "kind": if i % 4 == 3 { "contract_interaction" } else { "transfer" },
                        "wallet": request.target,
                        "usd_value": usd,
                        "chain": "base",
                    }),
                    ActionType::LpRecon => json!({
                        "txHash": tx,
                        "logIndex": 0,
                        "timestamp": ts,
                        "kind": if i % 3 == 2 { "lp_remove" } else { "lp_add" },
                        "wallet": format!("0xmockwallet{}", byte % 5),
                        "pool": request.target,
                        "usd_value": usd,
                        "chain": "base",
                    }),
                    ActionType::ExploreMetrics => json!({
                        "timestamp": ts,
                        "kind": "metrics",
                        "pool": request.target,
                        "metrics": {"volume_usd": usd * 10.0, "tvl_usd": usd * 100.0},
                        "chain": "base",
                    }),
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        MOCK_PROVIDER
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, ProviderError> {
        let events = self.synthesize(request);
        let payload = serde_json::to_string(&json!({ "events": events }))
            .map_err(|e| ProviderError::TransientNetwork(e.to_string()))?;
        Ok(RawResponse {
            payload,
            params: json!({ "fixture": true, "events": self.events_per_fetch }),
        })
    }
}

/// Generic JSON-over-HTTP feed driven by a URL template.
pub struct HttpProvider {
    name: String,
    url_template: String,
    token_env: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn from_config(cfg: &HttpProviderConfig) -> Self {
        let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: cfg.name.trim().to_ascii_lowercase(),
            url_template: cfg.url.clone(),
            token_env: cfg.token_env.clone(),
            client,
        }
    }

    pub fn render_url(&self, request: &FetchRequest) -> String {
        self.url_template
            .replace("{target}", &request.target)
            .replace("{action}", request.action.as_str())
            .replace("{since}", &request.since.timestamp().to_string())
            .replace("{until}", &request.until.timestamp().to_string())
    }

    fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|k| std::env::var(k).ok())
            .filter(|t| !t.trim().is_empty())
    }
}

/// Map an HTTP status onto the provider error taxonomy. `None` means the body is usable.
pub fn classify_status(status: u16, context: &str) -> Option<ProviderError> {
    match status {
        200..=299 => None,
        429 => Some(ProviderError::RateLimited(format!("{context}: HTTP 429"))),
        401 | 403 => Some(ProviderError::AuthFailed(format!("{context}: HTTP {status}"))),
        404 | 410 => Some(ProviderError::NotFound(format!("{context}: HTTP {status}"))),
        _ => Some(ProviderError::TransientNetwork(format!(
            "{context}: HTTP {status}"
        ))),
    }
}

#[async_trait::async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, ProviderError> {
        let url = self.render_url(request);
        let mut req = self.client.get(&url);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::TransientNetwork(e.to_string()))?;
        if let Some(err) = classify_status(resp.status().as_u16(), &self.name) {
            return Err(err);
        }
        let payload = resp
            .text()
            .await
            .map_err(|e| ProviderError::TransientNetwork(e.to_string()))?;
        Ok(RawResponse {
            payload,
            params: json!({
                "url": self.url_template,
                "since": request.since.timestamp(),
                "until": request.until.timestamp(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use recon_store::from_unix;

    fn request(action: ActionType) -> FetchRequest {
        FetchRequest {
            action,
            target: "0xabc".into(),
            since: from_unix(0),
            until: from_unix(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn mock_is_deterministic_and_windowed() {
        let mock = MockProvider::new(4);
        let req = request(ActionType::WalletRecon);
        let a = mock.fetch(&req).await.unwrap();
        let b = mock.fetch(&req).await.unwrap();
        assert_eq!(a, b);
        let parsed: Value = serde_json::from_str(&a.payload).unwrap();
        let events = parsed["events"].as_array().unwrap();
        assert_eq!(events.len(), 4);
        for ev in events {
            let ts = ev["timestamp"].as_i64().unwrap();
            assert!(ts > 1_700_000_000 - 86_400 && ts <= 1_700_000_000);
        }
    }

    #[test]
    fn status_mapping() {
        assert!(classify_status(200, "p").is_none());
        let kind = |s| classify_status(s, "p").unwrap().kind();
        assert_eq!(kind(429), ProviderErrorKind::RateLimited);
        assert_eq!(kind(401), ProviderErrorKind::AuthFailed);
        assert_eq!(kind(403), ProviderErrorKind::AuthFailed);
        assert_eq!(kind(404), ProviderErrorKind::NotFound);
        assert_eq!(kind(503), ProviderErrorKind::TransientNetwork);
    }

    #[test]
    fn url_template_substitution() {
        let provider = HttpProvider::from_config(&HttpProviderConfig {
            name: "Alchemy".into(),
            url: "https://feed.example/{action}/{target}?from={since}&to={until}".into(),
            token_env: None,
            timeout_ms: None,
        });
        assert_eq!(provider.name(), "alchemy");
        assert_eq!(
            provider.render_url(&request(ActionType::LpRecon)),
            "https://feed.example/lp_recon/0xabc?from=0&to=1700000000"
        );
    }

    #[test]
    fn chains_from_config_end_with_mock() {
        let cfg = crate::config::parse_config(
            r#"
            [providers]
            wallet_recon = ["alchemy", "unknown"]
            [[http_providers]]
            name = "alchemy"
            url = "https://feed.example/{target}"
            "#,
        )
        .unwrap();
        let chains = ProviderChains::from_config(&cfg);
        let names: Vec<_> = chains
            .chain(ActionType::WalletRecon)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["alchemy", "mock"]);
        assert_eq!(chains.chain(ActionType::ExploreMetrics).len(), 1);
    }
}
