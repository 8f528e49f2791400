//! Alerting rules and the per-label-set alert lifecycle.
//!
//! An instance is Pending from the first evaluation that selects its label
//! set and becomes Firing once it has stayed selected for the rule's `for`
//! duration. The first evaluation that no longer selects it drops the
//! instance entirely.

use super::template::{self, TemplateData};
use super::{RuleHealth, RuleState};
use crate::query::{self, QueryEngine, Value};
use crate::{Error, Labels, Result, Timestamp, METRIC_NAME_LABEL};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const ALERT_NAME_LABEL: &str = "alertname";
pub const ALERT_STATE_LABEL: &str = "alertstate";
pub const ALERTS_METRIC: &str = "ALERTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Firing,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        }
    }
}

/// One active alert instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Result labels plus rule labels and `alertname`
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub state: AlertState,
    /// First evaluation that selected this label set
    pub active_at: Timestamp,
    /// Most recent evaluation that selected it
    pub last_active_at: Timestamp,
    pub fired_at: Option<Timestamp>,
    pub value: f64,
}

impl Alert {
    pub fn name(&self) -> &str {
        self.labels.get(ALERT_NAME_LABEL).unwrap_or_default()
    }
}

/// Alerting rule definition plus its live instances
pub struct AlertingRule {
    name: String,
    expr: String,
    for_ms: Timestamp,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    active: Mutex<HashMap<Labels, Alert>>,
    pub(crate) state: Mutex<RuleState>,
}

impl AlertingRule {
    pub fn new(
        name: impl Into<String>,
        expr: impl Into<String>,
        for_ms: Timestamp,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        let expr = expr.into();
        query::parse(&expr).map_err(|e| Error::Config(format!("alert {}: {}", name, e)))?;
        for text in labels.values().chain(annotations.values()) {
            template::validate(text).map_err(|e| Error::Config(format!("alert {}: {}", name, e)))?;
        }
        if for_ms < 0 {
            return Err(Error::Config(format!("alert {}: negative for duration", name)));
        }
        Ok(Self {
            name,
            expr,
            for_ms,
            labels,
            annotations,
            active: Mutex::new(HashMap::new()),
            state: Mutex::new(RuleState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn for_ms(&self) -> Timestamp {
        self.for_ms
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Same definition, so live state may be carried over
    pub fn same_definition(&self, other: &AlertingRule) -> bool {
        self.name == other.name
            && self.expr == other.expr
            && self.for_ms == other.for_ms
            && self.labels == other.labels
            && self.annotations == other.annotations
    }

    /// Take over the live instances of a previous version of this rule
    pub fn restore_from(&self, previous: &AlertingRule) {
        *self.active.lock() = previous.active.lock().clone();
    }

    /// Active instances, ordered by labels
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.lock().values().cloned().collect();
        alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
        alerts
    }

    pub fn firing(&self) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.state == AlertState::Firing)
            .collect()
    }

    /// Evaluate at `ts`, advance the lifecycle and return the `ALERTS`
    /// samples for the active instances
    pub fn eval(&self, engine: &QueryEngine, ts: Timestamp) -> Result<Vec<(Labels, Timestamp, f64)>> {
        let result = engine.instant_query(&self.expr, ts)?;
        let elements: Vec<(Labels, f64)> = match result.value {
            Value::Vector(v) => v.into_iter().map(|s| (s.labels, s.v)).collect(),
            Value::Scalar { v, .. } => vec![(Labels::empty(), v)],
            other => {
                return Err(Error::Internal(format!(
                    "alert {}: expression returned {}, expected vector or scalar",
                    self.name,
                    other.type_name()
                )))
            }
        };

        let mut seen: HashMap<Labels, Alert> = HashMap::with_capacity(elements.len());
        for (labels, value) in elements {
            let labels = labels.without_metric_name();
            let data = TemplateData {
                labels: &labels,
                value,
            };

            let mut builder = labels.builder();
            for (name, text) in &self.labels {
                builder.set(name, &template::expand_lossy(text, &data));
            }
            builder.set(ALERT_NAME_LABEL, &self.name);
            let alert_labels = builder.build();

            let annotations = self
                .annotations
                .iter()
                .map(|(k, text)| (k.clone(), template::expand_lossy(text, &data)))
                .collect();

            if seen.contains_key(&alert_labels) {
                return Err(Error::Internal(format!(
                    "alert {}: vector contains metrics with the same labelset after applying alert labels",
                    self.name
                )));
            }
            seen.insert(
                alert_labels.clone(),
                Alert {
                    labels: alert_labels,
                    annotations,
                    state: AlertState::Pending,
                    active_at: ts,
                    last_active_at: ts,
                    fired_at: None,
                    value,
                },
            );
        }

        let mut active = self.active.lock();
        // anything not selected this round is dropped here
        let mut next = HashMap::with_capacity(seen.len());
        for (key, mut alert) in seen {
            if let Some(prev) = active.remove(&key) {
                alert.active_at = prev.active_at;
                alert.state = prev.state;
                alert.fired_at = prev.fired_at;
            }
            if alert.state == AlertState::Pending && ts - alert.active_at >= self.for_ms {
                alert.state = AlertState::Firing;
                alert.fired_at = Some(ts);
            }
            next.insert(key, alert);
        }
        *active = next;

        Ok(active
            .values()
            .map(|alert| {
                let mut builder = alert.labels.builder();
                builder.set(METRIC_NAME_LABEL, ALERTS_METRIC);
                builder.set(ALERT_STATE_LABEL, alert.state.as_str());
                (builder.build(), ts, 1.0)
            })
            .collect())
    }

    pub fn health(&self) -> RuleHealth {
        self.state.lock().health
    }
}

impl std::fmt::Debug for AlertingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertingRule")
            .field("name", &self.name)
            .field("expr", &self.expr)
            .field("for_ms", &self.for_ms)
            .finish()
    }
}
