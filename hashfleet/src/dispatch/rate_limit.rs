//! Alert cooldowns.
//!
//! One notification per `(AlertKind, rule)` per cooldown window. The
//! limiter lives on the dispatcher so every rule shares the same view of
//! what was recently sent.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::AlertKind;
use crate::automation::RuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldowns {
    pub generic: Duration,
    pub thermal: Duration,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            generic: Duration::from_secs(5 * 60),
            thermal: Duration::from_secs(15 * 60),
        }
    }
}

impl Cooldowns {
    pub fn for_kind(&self, kind: AlertKind) -> Duration {
        match kind {
            AlertKind::Thermal => self.thermal,
            _ => self.generic,
        }
    }
}

/// Result of [`AlertLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Suppressed; the window reopens after `remaining`.
    Limited { remaining: Duration },
}

type Key = (AlertKind, Option<RuleId>);

#[derive(Debug, Default)]
pub struct AlertLimiter {
    cooldowns: Cooldowns,
    last_sent: HashMap<Key, Instant>,
}

impl AlertLimiter {
    pub fn new(cooldowns: Cooldowns) -> Self {
        Self {
            cooldowns,
            last_sent: HashMap::new(),
        }
    }

    /// Check and, when allowed, start a new window for this key.
    pub fn check(&mut self, kind: AlertKind, rule: Option<&RuleId>, now: Instant) -> Verdict {
        let cooldown = self.cooldowns.for_kind(kind);
        let key = (kind, rule.cloned());

        if let Some(&last) = self.last_sent.get(&key) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                return Verdict::Limited {
                    remaining: cooldown - elapsed,
                };
            }
        }

        self.last_sent.insert(key, now);
        Verdict::Allowed
    }

    /// Drop windows that have already closed.
    pub fn prune(&mut self, now: Instant) {
        let cooldowns = self.cooldowns;
        self.last_sent.retain(|(kind, _), last| {
            now.saturating_duration_since(*last) < cooldowns.for_kind(*kind)
        });
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}
