use serde::{Deserialize, Serialize};

/// Pipeline stages that carry their own timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Budget,
    Planner,
    Worker,
    Analyze,
    Brief,
    Memory,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Budget => "budget",
            Stage::Planner => "planner",
            Stage::Worker => "worker",
            Stage::Analyze => "analyze",
            Stage::Brief => "brief",
            Stage::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    AuthFailed,
    NotFound,
    TransientNetwork,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::AuthFailed => "auth_failed",
            ProviderErrorKind::NotFound => "not_found",
            ProviderErrorKind::TransientNetwork => "transient_network",
        }
    }

    /// Whether another attempt against the same provider can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::TransientNetwork
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient network error: {0}")]
    TransientNetwork(String),
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::RateLimited(_) => ProviderErrorKind::RateLimited,
            ProviderError::AuthFailed(_) => ProviderErrorKind::AuthFailed,
            ProviderError::NotFound(_) => ProviderErrorKind::NotFound,
            ProviderError::TransientNetwork(_) => ProviderErrorKind::TransientNetwork,
        }
    }
}

/// A single malformed sub-record inside a raw payload.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("record {index}: {reason}")]
pub struct ValidationError {
    pub index: usize,
    pub reason: String,
}

#[derive(thiserror::Error, Debug)]
pub enum SummarizeError {
    #[error("summarizer unavailable: {0}")]
    Unavailable(String),
    #[error("summarizer returned no text")]
    Empty,
    #[error("summarizer failed: {0}")]
    Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("{stage} stage timed out")]
    Timeout { stage: Stage },
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("config does not match schema: {}", .0.join(", "))]
    Schema(Vec<String>),
    #[error("invalid config value: {0}")]
    Invalid(String),
}
