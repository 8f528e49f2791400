//! Alert notification
//!
//! The [`Dispatcher`] turns the firing alerts reported after each rule
//! evaluation into grouped, debounced notifications and hands them to
//! [`Notifier`] implementations. Delivery is at-least-once: a notifier may
//! see the same group more than once after a transient failure.

mod dispatcher;
mod webhook;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherMetrics, Route};
pub use webhook::WebhookNotifier;

use crate::rules::Alert;
use crate::{Labels, Result, Timestamp};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Firing,
    Resolved,
}

/// One member alert of a notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifiedAlert {
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    /// When the alert started firing
    pub starts_at: Timestamp,
    pub ends_at: Option<Timestamp>,
    pub status: NotificationStatus,
}

impl NotifiedAlert {
    pub(crate) fn firing(alert: &Alert) -> Self {
        Self {
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.fired_at.unwrap_or(alert.active_at),
            ends_at: None,
            status: NotificationStatus::Firing,
        }
    }

    pub(crate) fn resolved(alert: &Alert, at: Timestamp) -> Self {
        Self {
            ends_at: Some(at),
            status: NotificationStatus::Resolved,
            ..Self::firing(alert)
        }
    }
}

/// A group of alerts sharing the route's grouping labels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub receiver: String,
    pub group_key: String,
    pub group_labels: Labels,
    pub status: NotificationStatus,
    pub alerts: Vec<NotifiedAlert>,
}

/// An external notification collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a batch of groups; must tolerate duplicates
    async fn notify(&self, groups: &[Notification]) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes notifications to the log
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, groups: &[Notification]) -> Result<()> {
        for group in groups {
            info!(
                receiver = %self.name,
                group = %group.group_key,
                status = ?group.status,
                "Notification with {} alerts",
                group.alerts.len()
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
