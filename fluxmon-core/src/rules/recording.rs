//! Recording rules

use super::RuleState;
use crate::query::{self, QueryEngine, Value};
use crate::{Error, Labels, Result, Timestamp, METRIC_NAME_LABEL};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// Persists the result of an expression as a new series
pub struct RecordingRule {
    record: String,
    expr: String,
    labels: BTreeMap<String, String>,
    pub(crate) state: Mutex<RuleState>,
}

impl RecordingRule {
    pub fn new(record: impl Into<String>, expr: impl Into<String>, labels: BTreeMap<String, String>) -> Result<Self> {
        let record = record.into();
        let expr = expr.into();
        if !is_metric_name(&record) {
            return Err(Error::Config(format!("invalid recording rule name {:?}", record)));
        }
        query::parse(&expr).map_err(|e| Error::Config(format!("record {}: {}", record, e)))?;
        Ok(Self {
            record,
            expr,
            labels,
            state: Mutex::new(RuleState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.record
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Evaluate at `ts` and return the samples to write back
    pub fn eval(&self, engine: &QueryEngine, ts: Timestamp) -> Result<Vec<(Labels, Timestamp, f64)>> {
        let result = engine.instant_query(&self.expr, ts)?;
        let elements: Vec<(Labels, f64)> = match result.value {
            Value::Vector(v) => v.into_iter().map(|s| (s.labels, s.v)).collect(),
            Value::Scalar { v, .. } => vec![(Labels::empty(), v)],
            other => {
                return Err(Error::Internal(format!(
                    "record {}: expression returned {}, expected vector or scalar",
                    self.record,
                    other.type_name()
                )))
            }
        };

        let mut seen = HashSet::with_capacity(elements.len());
        let mut out = Vec::with_capacity(elements.len());
        for (labels, v) in elements {
            let mut builder = labels.builder();
            builder.set(METRIC_NAME_LABEL, &self.record);
            for (name, value) in &self.labels {
                builder.set(name, value);
            }
            let labels = builder.build();
            if !seen.insert(labels.clone()) {
                return Err(Error::Internal(format!(
                    "record {}: vector contains metrics with the same labelset after applying rule labels",
                    self.record
                )));
            }
            out.push((labels, ts, v));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for RecordingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingRule")
            .field("record", &self.record)
            .field("expr", &self.expr)
            .finish()
    }
}

fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
