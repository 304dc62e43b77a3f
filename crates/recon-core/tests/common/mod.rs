#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::store::{from_unix, Store};
use recon_core::{
    ActionType, FetchRequest, Provider, ProviderChains, ProviderError, RawResponse, ReconConfig,
    Reconciler,
};
use serde_json::json;

pub const T0: i64 = 1_700_000_000;

pub fn t0() -> DateTime<Utc> {
    from_unix(T0)
}

/// Wallet feed that reports `count` transfers spread over the last few hours of the window.
pub struct TransferFeed {
    pub count: usize,
    pub calls: AtomicU32,
}

impl TransferFeed {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            count,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Provider for TransferFeed {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let until = request.until.timestamp();
        let events: Vec<_> = (0..self.count)
            .map(|i| {
                json!({
                    "txHash": format!("0x{}-{}-{}", request.target, until, i),
                    "logIndex": 0,
                    "timestamp": until - 600 * (i as i64 + 1),
                    "kind": "transfer",
                    "wallet": request.target,
                    "usd_value": 25.0 + i as f64,
                })
            })
            .collect();
        Ok(RawResponse {
            payload: serde_json::to_string(&events).unwrap(),
            params: json!({"count": self.count}),
        })
    }
}

/// Always fails with the given error.
pub struct DownFeed(pub ProviderError);

#[async_trait::async_trait]
impl Provider for DownFeed {
    fn name(&self) -> &str {
        "down"
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<RawResponse, ProviderError> {
        Err(self.0.clone())
    }
}

pub fn wallet_config(wallets: &[&str]) -> ReconConfig {
    let mut cfg = ReconConfig::default();
    cfg.targets.wallet_recon = wallets.iter().map(|w| w.to_string()).collect();
    cfg.worker.backoff_ms = 1;
    cfg
}

pub fn reconciler(store: &Store, cfg: ReconConfig, provider: Arc<dyn Provider>) -> Reconciler {
    let chains = ProviderChains::new().with_chain(ActionType::WalletRecon, vec![provider]);
    Reconciler::new(store.clone(), cfg, chains).unwrap()
}
