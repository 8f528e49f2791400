//! Query engine for FluxMon
//!
//! Supports:
//! - Instant and range vector selectors with label matchers and `offset`
//! - Arithmetic, comparison (with `bool`) and set operators with
//!   `on`/`ignoring` and `group_left`/`group_right` matching
//! - Aggregations with `by`/`without` grouping
//! - Counter functions (`rate`, `increase`, ...) with reset compensation,
//!   the `*_over_time` family and `histogram_quantile`
//!
//! Every query runs against one [`Querier`](crate::storage::Querier)
//! snapshot, so appends landing during evaluation are never observed.

mod aggregates;
pub mod ast;
mod eval;
mod functions;
mod lexer;
mod parser;

pub use aggregates::{
    Accumulator, CountAccumulator, GroupAccumulator, MaxAccumulator, MeanAccumulator, MinAccumulator,
    QuantileAccumulator, SumAccumulator, VarianceAccumulator,
};
pub use ast::Expr;
pub use lexer::parse_duration;
pub use parser::parse;

use crate::storage::Engine;
use crate::{Labels, QueryError, Sample, Timestamp};
use eval::{Evaluator, StepValue};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Most points a range query may return per series
pub const MAX_POINTS_PER_SERIES: i64 = 11_000;

/// Evaluation limits
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How far back an instant selector looks for a sample (ms)
    pub lookback_delta: Timestamp,
    pub timeout: Duration,
    /// Most samples a single query may load
    pub max_samples: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            lookback_delta: crate::config::LOOKBACK_DELTA_MS,
            timeout: Duration::from_millis(crate::config::QUERY_TIMEOUT_MS),
            max_samples: crate::config::QUERY_MAX_SAMPLES,
        }
    }
}

/// One element of an instant vector result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorSample {
    pub labels: Labels,
    pub t: Timestamp,
    pub v: f64,
}

/// One series of a range result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// Typed query result
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar { t: Timestamp, v: f64 },
    String { t: Timestamp, v: String },
    Vector(Vec<VectorSample>),
    Matrix(Vec<RangeSeries>),
}

impl Value {
    /// Wire name of the result type
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar { .. } => "scalar",
            Value::String { .. } => "string",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
        }
    }

    /// Instant vector elements; empty for other types
    pub fn into_vector(self) -> Vec<VectorSample> {
        match self {
            Value::Vector(v) => v,
            _ => Vec::new(),
        }
    }
}

/// Query output
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub value: Value,
    /// Partial-data warnings, e.g. excluded corrupt blocks
    pub warnings: Vec<String>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

/// Parse a bare series selector such as `up{job="api"}` into its matchers
pub fn parse_selector(input: &str) -> Result<Vec<crate::Matcher>, QueryError> {
    match parse(input)? {
        Expr::VectorSelector(vs) if vs.offset == 0 => {
            if vs.matchers.iter().all(|m| m.matches_empty()) {
                return Err(QueryError::BadData(format!(
                    "match[] must contain at least one non-empty matcher: {}",
                    input
                )));
            }
            Ok(vs.matchers)
        }
        _ => Err(QueryError::BadData(format!("invalid series selector: {}", input))),
    }
}

/// Evaluates expressions against the storage engine
#[derive(Clone)]
pub struct QueryEngine {
    storage: Arc<Engine>,
    options: QueryOptions,
}

impl QueryEngine {
    pub fn new(storage: Arc<Engine>, options: QueryOptions) -> Self {
        Self { storage, options }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<Engine> {
        &self.storage
    }

    /// Copy of this engine with a tighter timeout; never loosens it
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut options = self.options.clone();
        options.timeout = options.timeout.min(timeout);
        Self {
            storage: self.storage.clone(),
            options,
        }
    }

    /// Evaluate `query` at time `t`
    pub fn instant_query(&self, query: &str, t: Timestamp) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        let expr = parse(query)?;
        let deadline = started + self.options.timeout;

        let querier = self.storage.querier();
        let mut evaluator = Evaluator::new(&querier, self.options.lookback_delta, deadline, self.options.max_samples);
        evaluator.preload(&expr, t, t)?;

        let value = match evaluator.instant(&expr, t)? {
            StepValue::Scalar(v) => Value::Scalar { t, v },
            StepValue::String(v) => Value::String { t, v },
            StepValue::Vector(elems) => Value::Vector(
                elems
                    .into_iter()
                    .map(|e| VectorSample {
                        labels: e.labels,
                        t,
                        v: e.v,
                    })
                    .collect(),
            ),
            StepValue::Matrix(series) => Value::Matrix(
                series
                    .into_iter()
                    .map(|r| RangeSeries {
                        labels: r.labels,
                        samples: r.samples,
                    })
                    .collect(),
            ),
        };

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!("Instant query {:?} at {} took {:.3}ms", query, t, execution_time_ms);
        Ok(QueryResult {
            value,
            warnings: querier.warnings(),
            execution_time_ms,
        })
    }

    /// Evaluate `query` at every `step` milliseconds from `start` to `end`
    pub fn range_query(
        &self,
        query: &str,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<QueryResult, QueryError> {
        if step <= 0 {
            return Err(QueryError::BadData(
                "zero or negative query resolution step widths are not accepted".into(),
            ));
        }
        if end < start {
            return Err(QueryError::BadData("end timestamp must not be before start time".into()));
        }
        if (end - start) / step > MAX_POINTS_PER_SERIES {
            return Err(QueryError::BadData(format!(
                "exceeded maximum resolution of {} points per timeseries, try decreasing the query resolution",
                MAX_POINTS_PER_SERIES
            )));
        }

        let started = Instant::now();
        let expr = parse(query)?;
        let deadline = started + self.options.timeout;

        let querier = self.storage.querier();
        let mut evaluator = Evaluator::new(&querier, self.options.lookback_delta, deadline, self.options.max_samples);
        evaluator.preload(&expr, start, end)?;
        let series = evaluator.range(&expr, start, end, step)?;

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Range query {:?} [{}, {}] step {} returned {} series in {:.3}ms",
            query,
            start,
            end,
            step,
            series.len(),
            execution_time_ms
        );
        Ok(QueryResult {
            value: Value::Matrix(
                series
                    .into_iter()
                    .map(|(labels, samples)| RangeSeries { labels, samples })
                    .collect(),
            ),
            warnings: querier.warnings(),
            execution_time_ms,
        })
    }
}
