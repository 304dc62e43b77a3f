//! Staleness-driven reconciliation of external activity feeds into the layered store.
//!
//! [`Reconciler::run_cycle`] is the single entry point; everything else is exposed so the
//! stages can be exercised on their own.

pub mod action;
pub mod analyze;
pub mod brief;
pub mod config;
pub mod cycle;
pub mod error;
pub mod memory;
pub mod notify;
pub mod planner;
pub mod provider;
pub mod staleness;
pub mod worker;

pub use action::ActionType;
pub use analyze::{compute_signals, normalize, Normalized, SignalSet};
pub use brief::{GateDecision, GatePolicy, SkipReason, Summarizer, Summary, TemplateSummarizer};
pub use config::{config_schema_json, load_config, load_with_env, ReconConfig};
pub use cycle::{CycleOutcome, OutcomeKind, Reconciler, SkipCause};
pub use error::{
    ConfigError, CycleError, ProviderError, ProviderErrorKind, Stage, SummarizeError,
    ValidationError,
};
pub use notify::{LogNotifier, Notifier, SharedNotifier};
pub use planner::{Plan, Selection};
pub use provider::{FetchRequest, MockProvider, Provider, ProviderChains, RawResponse};
pub use worker::{FetchResult, Worker};

pub use recon_store as store;
