//! Tracing setup shared by the reconciler binaries.
//!
//! Console output always goes to stderr. With `RECON_LOG_ROLL=1` every event is also written
//! without ANSI colour to a rolling file under `RECON_LOG_DIR` (default `logs`), rotated per
//! `RECON_LOG_ROTATION` (`hourly`, `minutely` or `daily`).

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

const LOG_PREFIX: &str = "recon";

/// Install the global subscriber. Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    if std::env::var("RECON_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("RECON_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let rotation = std::env::var("RECON_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create log directory");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, LOG_PREFIX),
            "minutely" => tracing_appender::rolling::minutely(&dir, LOG_PREFIX),
            _ => tracing_appender::rolling::daily(&dir, LOG_PREFIX),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let file_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(file_filter);
        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
