use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::action::ActionType;
use crate::error::{ConfigError, Stage};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// HTTP provider timeout when `timeout_ms` is unset.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

/// Upper bound for `worker.backoff_ms`.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Variables read by [`ReconConfig::apply_env_overrides`].
pub const ENV_OVERRIDES: [&str; 4] = [
    "RECON_STATE_DIR",
    "RECON_BUDGET_DAILY",
    "RECON_WEBHOOK_URL",
    "RECON_WALLETS",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct ReconConfig {
    /// Directory holding the SQLite database (default `state`).
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub analyze: AnalyzeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub http_providers: Vec<HttpProviderConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily spend cap in USD.
    pub daily_cap_usd: f64,
    /// Estimated cost of one action, in USD.
    pub cost_usd: ActionCosts,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cap_usd: 5.0,
            cost_usd: ActionCosts::default(),
        }
    }
}

impl BudgetConfig {
    pub fn daily_cap_micros(&self) -> i64 {
        usd_to_micros(self.daily_cap_usd)
    }

    pub fn cost_micros(&self, action: ActionType) -> i64 {
        usd_to_micros(self.cost_usd.for_action(action))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ActionCosts {
    pub wallet_recon: f64,
    pub lp_recon: f64,
    pub explore_metrics: f64,
}

impl Default for ActionCosts {
    fn default() -> Self {
        Self {
            wallet_recon: 0.05,
            lp_recon: 0.05,
            explore_metrics: 0.10,
        }
    }
}

impl ActionCosts {
    pub fn for_action(&self, action: ActionType) -> f64 {
        match action {
            ActionType::WalletRecon => self.wallet_recon,
            ActionType::LpRecon => self.lp_recon,
            ActionType::ExploreMetrics => self.explore_metrics,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct GateConfig {
    pub threshold_events: u64,
    pub threshold_signal: f64,
    pub cooldown_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold_events: 5,
            threshold_signal: 0.6,
            cooldown_secs: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct AnalyzeConfig {
    /// Trailing window for signal computation.
    pub window_secs: u64,
    /// Event count at which the count component of the activity score saturates.
    pub event_ceiling: u64,
    /// Absolute net liquidity delta at which the delta component saturates.
    pub delta_ceiling: f64,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            window_secs: 24 * 3600,
            event_ceiling: 15,
            delta_ceiling: 10_000.0,
        }
    }
}

impl AnalyzeConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct WorkerConfig {
    /// Attempts per provider before falling through.
    pub max_attempts: u32,
    /// Base backoff; doubles per retry.
    pub backoff_ms: u64,
    /// Concurrent cycles in batch mode.
    pub max_parallel: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct TimeoutConfig {
    pub planner_secs: u64,
    pub worker_secs: u64,
    pub analyze_secs: u64,
    pub brief_secs: u64,
    pub memory_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            planner_secs: 10,
            worker_secs: 20,
            analyze_secs: 15,
            brief_secs: 10,
            memory_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn for_stage(&self, stage: Stage) -> StdDuration {
        let secs = match stage {
            Stage::Budget | Stage::Planner => self.planner_secs,
            Stage::Worker => self.worker_secs,
            Stage::Analyze => self.analyze_secs,
            Stage::Brief => self.brief_secs,
            Stage::Memory => self.memory_secs,
        };
        StdDuration::from_secs(secs.max(1))
    }
}

/// Monitored targets per action type.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct TargetsConfig {
    pub wallet_recon: Vec<String>,
    pub lp_recon: Vec<String>,
    pub explore_metrics: Vec<String>,
}

impl TargetsConfig {
    pub fn for_action(&self, action: ActionType) -> &[String] {
        match action {
            ActionType::WalletRecon => &self.wallet_recon,
            ActionType::LpRecon => &self.lp_recon,
            ActionType::ExploreMetrics => &self.explore_metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        ActionType::ALL
            .iter()
            .all(|a| self.for_action(*a).is_empty())
    }
}

/// Ordered provider names per action type. `mock` is always appended if absent.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ProvidersConfig {
    pub wallet_recon: Vec<String>,
    pub lp_recon: Vec<String>,
    pub explore_metrics: Vec<String>,
}

impl ProvidersConfig {
    pub fn chain_for(&self, action: ActionType) -> Vec<String> {
        let configured = match action {
            ActionType::WalletRecon => &self.wallet_recon,
            ActionType::LpRecon => &self.lp_recon,
            ActionType::ExploreMetrics => &self.explore_metrics,
        };
        let mut chain: Vec<String> = Vec::with_capacity(configured.len() + 1);
        for name in configured {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !chain.contains(&name) {
                chain.push(name);
            }
        }
        if let Some(pos) = chain.iter().position(|n| n == crate::provider::MOCK_PROVIDER) {
            chain.remove(pos);
        }
        chain.push(crate::provider::MOCK_PROVIDER.to_string());
        chain
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct HttpProviderConfig {
    pub name: String,
    /// URL template; `{target}`, `{action}`, `{since}` and `{until}` are substituted.
    pub url: String,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct NotifyConfig {
    /// Discord-compatible webhook; notifications are logged only when unset.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Hand every window event to the summarizer.
    #[default]
    Full,
    /// Reduce the event list to fit `token_cap` first.
    Budgeted,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct SummaryConfig {
    pub input_policy: InputPolicy,
    pub token_cap: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            input_policy: InputPolicy::Full,
            token_cap: 120_000,
        }
    }
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(ReconConfig);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(ReconConfig);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str) -> Result<ReconConfig, ConfigError> {
    let raw: toml::Value = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Schema(validation_errors));
    }
    let cfg: ReconConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<ReconConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load `path` if given (defaults otherwise), then apply environment overrides.
pub fn load_with_env(path: Option<&Path>) -> Result<ReconConfig, ConfigError> {
    let mut cfg = match path {
        Some(p) => load_config(p)?,
        None => ReconConfig::default(),
    };
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

impl ReconConfig {
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.state_dir.as_deref().unwrap_or("state"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.budget.daily_cap_usd.is_finite() && self.budget.daily_cap_usd >= 0.0) {
            return Err(ConfigError::Invalid(
                "budget.daily_cap_usd must be a non-negative number".into(),
            ));
        }
        for action in ActionType::ALL {
            let cost = self.budget.cost_usd.for_action(action);
            if !(cost.is_finite() && cost >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "budget.cost_usd.{} must be a non-negative number",
                    action.as_str()
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.gate.threshold_signal) {
            return Err(ConfigError::Invalid(
                "gate.threshold_signal must be within [0, 1]".into(),
            ));
        }
        if self.gate.cooldown_secs == 0 {
            return Err(ConfigError::Invalid("gate.cooldown_secs must be > 0".into()));
        }
        if self.analyze.event_ceiling == 0 || self.analyze.delta_ceiling <= 0.0 {
            return Err(ConfigError::Invalid(
                "analyze ceilings must be positive".into(),
            ));
        }
        if self.worker.backoff_ms > MAX_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "worker.backoff_ms must be at most {MAX_BACKOFF_MS}"
            )));
        }
        let worker_ms = self.timeouts.for_stage(Stage::Worker).as_millis() as u64;
        for http in &self.http_providers {
            if http.name.trim().is_empty() || http.url.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "http_providers entries need a name and url".into(),
                ));
            }
            let timeout_ms = http.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);
            if timeout_ms == 0 || timeout_ms >= worker_ms {
                return Err(ConfigError::Invalid(format!(
                    "http_providers.{}: timeout_ms ({timeout_ms}) must be positive and below timeouts.worker_secs ({worker_ms}ms)",
                    http.name
                )));
            }
        }
        Ok(())
    }

    /// Environment wins over the file. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_string("RECON_STATE_DIR") {
            self.state_dir = Some(dir);
        }
        if let Some(raw) = env_string("RECON_BUDGET_DAILY") {
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => self.budget.daily_cap_usd = v,
                _ => tracing::warn!(
                    target: "recon::config",
                    value = %raw,
                    "ignoring invalid RECON_BUDGET_DAILY"
                ),
            }
        }
        if let Some(url) = env_string("RECON_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(list) = env_string("RECON_WALLETS") {
            for wallet in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if !self.targets.wallet_recon.iter().any(|w| w == wallet) {
                    self.targets.wallet_recon.push(wallet.to_string());
                }
            }
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn usd_to_micros(usd: f64) -> i64 {
    (usd.max(0.0) * MICROS_PER_USD).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Holds the env lock with every override variable cleared; prior values return on drop.
    struct OverrideEnv {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl OverrideEnv {
        fn clean() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let saved = ENV_OVERRIDES
                .iter()
                .map(|&key| (key, std::env::var(key).ok()))
                .collect();
            for key in ENV_OVERRIDES {
                std::env::remove_var(key);
            }
            Self { _lock: lock, saved }
        }

        fn with(self, key: &'static str, value: &str) -> Self {
            assert!(ENV_OVERRIDES.contains(&key), "{key} is not an override variable");
            std::env::set_var(key, value);
            self
        }
    }

    impl Drop for OverrideEnv {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.budget.daily_cap_micros(), 5_000_000);
        assert_eq!(cfg.gate.threshold_events, 5);
        assert_eq!(cfg.gate.cooldown_secs, 21_600);
        assert_eq!(cfg.timeouts.for_stage(Stage::Worker), StdDuration::from_secs(20));
        assert_eq!(cfg.summary.input_policy, InputPolicy::Full);
        assert_eq!(cfg.state_dir(), PathBuf::from("state"));
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let cfg = parse_config(
            r#"
            state_dir = "/tmp/recon"
            [gate]
            threshold_events = 8
            [targets]
            wallet_recon = ["0xabc"]
            [providers]
            wallet_recon = ["alchemy", "mock", "covalent"]
            [[http_providers]]
            name = "alchemy"
            url = "https://feed.example/{target}?since={since}"
            token_env = "ALCHEMY_TOKEN"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gate.threshold_events, 8);
        assert_eq!(cfg.gate.threshold_signal, 0.6);
        assert_eq!(cfg.targets.wallet_recon, vec!["0xabc".to_string()]);
        assert_eq!(
            cfg.providers.chain_for(ActionType::WalletRecon),
            vec!["alchemy", "covalent", "mock"]
        );
        assert_eq!(cfg.providers.chain_for(ActionType::LpRecon), vec!["mock"]);
        assert_eq!(cfg.http_providers.len(), 1);
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = parse_config("[gate]\nthreshold_events = \"five\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)), "{err}");
    }

    #[test]
    fn semantic_validation_rejects_bad_values() {
        let err = parse_config("[gate]\nthreshold_signal = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let _env = OverrideEnv::clean()
            .with("RECON_BUDGET_DAILY", "2.5")
            .with("RECON_WALLETS", "0xa, 0xb,,0xa")
            .with("RECON_STATE_DIR", "/var/lib/recon");
        let cfg = load_with_env(None).unwrap();
        assert_eq!(cfg.budget.daily_cap_micros(), 2_500_000);
        assert_eq!(cfg.targets.wallet_recon, vec!["0xa", "0xb"]);
        assert_eq!(cfg.state_dir(), PathBuf::from("/var/lib/recon"));
        assert!(cfg.notify.webhook_url.is_none());
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let _env = OverrideEnv::clean().with("RECON_BUDGET_DAILY", "lots");
        let cfg = load_with_env(None).unwrap();
        assert_eq!(cfg.budget.daily_cap_usd, 5.0);
    }

    #[test]
    fn schema_export_mentions_sections() {
        let schema = config_schema_json();
        let props = schema["properties"].as_object().unwrap();
        for key in ["budget", "gate", "analyze", "worker", "timeouts", "targets"] {
            assert!(props.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn provider_timeout_must_fit_the_worker_deadline() {
        let err = parse_config(
            r#"
            [timeouts]
            worker_secs = 10
            [[http_providers]]
            name = "slow"
            url = "https://feed.example/{target}"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout_ms"), "{err}");

        let cfg = parse_config(
            r#"
            [timeouts]
            worker_secs = 10
            [[http_providers]]
            name = "fast"
            url = "https://feed.example/{target}"
            timeout_ms = 4000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http_providers[0].timeout_ms, Some(4000));
    }

    #[test]
    fn oversized_backoff_is_rejected() {
        let err = parse_config("[worker]\nbackoff_ms = 600000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }
}
