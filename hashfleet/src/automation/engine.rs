use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{AutomationRule, RuleId};
use crate::device::Device;
use crate::dispatch::{Action, Origin};
use crate::price::Price;
use crate::telemetry::FleetView;

/// Everything a trigger may look at, frozen for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub now: OffsetDateTime,
    pub price: Option<Price>,
    pub fleet: &'a FleetView,
    pub devices: &'a [Device],
}

/// Diagnostic record of one rule in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule: RuleId,
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub matched: bool,
    pub detail: Option<String>,
    /// Actions the rule produced.
    pub actions: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// One record per configured rule, in evaluation order.
    pub records: Vec<RuleEvaluation>,
    /// In application order: highest priority number first, so the
    /// lowest number is applied last and its effect is the one that
    /// remains.
    pub actions: Vec<(Action, Origin)>,
}

/// Evaluate every enabled rule in `(priority, id)` order.
///
/// No short-circuit: every matching rule contributes actions. A trigger
/// that cannot be decided (no price, no telemetry) simply does not fire.
pub fn evaluate(rules: &[AutomationRule], ctx: &RuleContext<'_>) -> Evaluation {
    let mut ordered: Vec<&AutomationRule> = rules.iter().collect();
    ordered.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

    let mut records = Vec::with_capacity(ordered.len());
    let mut fired: Vec<Vec<(Action, Origin)>> = Vec::new();

    for rule in ordered {
        let detail = if rule.enabled {
            rule.trigger.fires(ctx)
        } else {
            None
        };

        let actions: Vec<(Action, Origin)> = match &detail {
            Some(detail) => rule
                .action
                .expand(ctx.devices, detail)
                .into_iter()
                .map(|a| (a, Origin::Rule(rule.id.clone())))
                .collect(),
            None => Vec::new(),
        };

        records.push(RuleEvaluation {
            rule: rule.id.clone(),
            name: rule.name.clone(),
            priority: rule.priority,
            enabled: rule.enabled,
            matched: detail.is_some(),
            detail,
            actions: actions.len(),
        });
        fired.push(actions);
    }

    let actions = fired.into_iter().rev().flatten().collect();
    Evaluation { records, actions }
}
