//! Outbound notifications.
//!
//! Delivery channels (chat bots, mail) live outside the controller. The
//! dispatcher only sees [`Notifier`]; a failed send is logged and audited,
//! never retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::tracing::prelude::*;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, severity: Severity, message: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: &str, severity: Severity, message: &str) -> anyhow::Result<()> {
        match severity {
            Severity::Info => info!(channel, "{message}"),
            Severity::Warning => warn!(channel, "{message}"),
            Severity::Critical => error!(channel, "{message}"),
        }
        Ok(())
    }
}
