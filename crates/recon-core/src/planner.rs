use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::action::ActionType;
use crate::config::{BudgetConfig, TargetsConfig};
use crate::staleness::{CursorSnapshot, Overdue};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub action: ActionType,
    pub target: String,
    pub overdue: Overdue,
    /// Cursor at planning time; the fetch window starts here (epoch when unseeded).
    pub last_success_at: Option<DateTime<Utc>>,
    pub cost_micros: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Nothing is stale (or every stale target is already being worked on).
    NoTargets,
    /// Stale targets exist but none fits the remaining headroom.
    BudgetExceeded { stale: usize, headroom_micros: i64 },
    Selected(Selection),
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::NoTargets => "no_targets",
            Plan::BudgetExceeded { .. } => "budget_exceeded",
            Plan::Selected(_) => "selected",
        }
    }
}

/// Everything the planner looks at. Holding references keeps [`plan`] free of side effects.
pub struct PlannerView<'a> {
    pub targets: &'a TargetsConfig,
    pub cursors: &'a CursorSnapshot,
    pub budget: &'a BudgetConfig,
    pub headroom_micros: i64,
    /// Targets claimed by cycles already in flight.
    pub busy: &'a HashSet<String>,
}

/// Rank stale targets most-overdue first (ties: target id, then action type) and pick the
/// best one whose cost fits the headroom.
pub fn plan(view: &PlannerView<'_>, now: DateTime<Utc>) -> Plan {
    let mut candidates: Vec<Selection> = Vec::new();
    for action in ActionType::ALL {
        let targets: BTreeSet<&str> = view
            .targets
            .for_action(action)
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        for target in targets {
            if view.busy.contains(target) {
                continue;
            }
            if let Some(overdue) = view.cursors.overdue_by(action, target, now) {
                candidates.push(Selection {
                    action,
                    target: target.to_string(),
                    overdue,
                    last_success_at: view.cursors.last_success(action, target),
                    cost_micros: view.budget.cost_micros(action),
                });
            }
        }
    }
    if candidates.is_empty() {
        return Plan::NoTargets;
    }
    candidates.sort_by(|a, b| {
        b.overdue
            .cmp(&a.overdue)
            .then_with(|| a.target.cmp(&b.target))
            .then_with(|| a.action.cmp(&b.action))
    });
    let stale = candidates.len();
    match candidates
        .into_iter()
        .find(|c| c.cost_micros <= view.headroom_micros)
    {
        Some(selection) => Plan::Selected(selection),
        None => Plan::BudgetExceeded {
            stale,
            headroom_micros: view.headroom_micros,
        },
    }
}
