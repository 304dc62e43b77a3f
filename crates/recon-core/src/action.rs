use chrono::Duration;
use serde::{Deserialize, Serialize};

/// The kinds of reconciliation the planner can schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    WalletRecon,
    LpRecon,
    ExploreMetrics,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::WalletRecon,
        ActionType::LpRecon,
        ActionType::ExploreMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::WalletRecon => "wallet_recon",
            ActionType::LpRecon => "lp_recon",
            ActionType::ExploreMetrics => "explore_metrics",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wallet_recon" | "wallet" => Some(ActionType::WalletRecon),
            "lp_recon" | "lp" | "pool" => Some(ActionType::LpRecon),
            "explore_metrics" | "explore" | "metrics" => Some(ActionType::ExploreMetrics),
            _ => None,
        }
    }

    /// Fixed staleness policy.
    pub fn staleness_threshold(&self) -> Duration {
        match self {
            ActionType::WalletRecon => Duration::hours(2),
            ActionType::LpRecon => Duration::hours(6),
            ActionType::ExploreMetrics => Duration::hours(24),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
