pub mod inspect;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use recon_core::{load_with_env, LogNotifier, ReconConfig, Reconciler, SharedNotifier};

use crate::webhook::WebhookNotifier;

pub use inspect::InspectCmd;
pub use run::{OnceArgs, RunArgs};

pub(crate) fn load(config: Option<&Path>) -> Result<ReconConfig> {
    load_with_env(config).with_context(|| match config {
        Some(path) => format!("loading config {}", path.display()),
        None => "loading config from environment".to_string(),
    })
}

/// Reconciler wired with the configured notifier (webhook when a URL is set, log otherwise).
pub(crate) fn reconciler(cfg: ReconConfig) -> Result<Reconciler> {
    let notifier: SharedNotifier = match cfg.notify.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(url)?),
        _ => Arc::new(LogNotifier),
    };
    let reconciler = Reconciler::from_config(cfg)?;
    Ok(reconciler.with_notifier(notifier))
}
