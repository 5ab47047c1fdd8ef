//! Notification sink: fire-and-forget messages tagged with a severity.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    /// Permission outcomes. Kept apart so a host can filter them.
    Permission,
}

pub trait Notifier {
    fn notify(&self, message: &str, severity: Severity);
}

/// Sink that only logs. Used when no host is listening.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Error => error!(target: "notify", "{message}"),
            Severity::Warning => warn!(target: "notify", "{message}"),
            Severity::Info | Severity::Success | Severity::Permission => {
                info!(target: "notify", ?severity, "{message}")
            }
        }
    }
}
