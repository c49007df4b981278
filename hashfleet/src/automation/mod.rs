//! Trigger/action automation rules.
//!
//! Rules are data: a [`Trigger`] that looks at the current price, the
//! clock or the fleet's health, and a [`RuleAction`] that names what to
//! do when it fires. Evaluation produces [`Action`](crate::dispatch::Action)s
//! for the dispatcher and never touches a device directly.

mod engine;
mod rule;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use engine::{Evaluation, RuleContext, RuleEvaluation, evaluate};
pub use rule::{AutomationRule, DailyWindow, HealthMetric, RuleAction, Trigger};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
