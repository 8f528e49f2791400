//! Step-wise evaluation of an expression over a read snapshot
//!
//! Every selector is loaded once for the whole query range before any
//! step is evaluated; steps then slice the loaded samples.

use super::aggregates::aggregate;
use super::ast::*;
use super::functions;
use crate::storage::Querier;
use crate::{Labels, MatchOp, QueryError, Sample, Timestamp, METRIC_NAME_LABEL};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

type EvalResult<T> = std::result::Result<T, QueryError>;

/// One element of an instant vector.
///
/// `t` is the raw sample's timestamp for plain selectors and the
/// evaluation time for everything derived from them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Elem {
    pub labels: Labels,
    pub t: Timestamp,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RangeElem {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepValue {
    Scalar(f64),
    String(String),
    Vector(Vec<Elem>),
    Matrix(Vec<RangeElem>),
}

struct Loaded {
    labels: Labels,
    samples: Vec<Sample>,
}

pub(crate) struct Evaluator<'a> {
    querier: &'a Querier,
    lookback: Timestamp,
    deadline: Instant,
    max_samples: usize,
    loaded_samples: usize,
    series: HashMap<usize, Vec<Loaded>>,
}

fn selector_key(vs: &VectorSelector) -> usize {
    vs as *const VectorSelector as usize
}

impl<'a> Evaluator<'a> {
    pub fn new(querier: &'a Querier, lookback: Timestamp, deadline: Instant, max_samples: usize) -> Self {
        Self {
            querier,
            lookback,
            deadline,
            max_samples,
            loaded_samples: 0,
            series: HashMap::new(),
        }
    }

    fn check_deadline(&self, stage: &str) -> EvalResult<()> {
        if Instant::now() >= self.deadline {
            return Err(QueryError::Timeout(stage.to_string()));
        }
        Ok(())
    }

    fn count_samples(&mut self, n: usize) -> EvalResult<()> {
        self.loaded_samples += n;
        if self.loaded_samples > self.max_samples {
            return Err(QueryError::TooManySamples {
                limit: self.max_samples,
            });
        }
        Ok(())
    }

    /// Load the samples of every selector in `expr` for steps in `[start, end]`
    pub fn preload(&mut self, expr: &Expr, start: Timestamp, end: Timestamp) -> EvalResult<()> {
        let mut uses = Vec::new();
        expr.selectors(&mut uses);
        let querier = self.querier;

        for u in uses {
            let vs = u.selector;
            let window = if u.range > 0 { u.range } else { self.lookback };
            let mint = start.saturating_sub(vs.offset).saturating_sub(window);
            let maxt = end.saturating_sub(vs.offset);

            let mut loaded = Vec::new();
            for series in querier.select(&vs.matchers, mint, maxt) {
                let mut samples = Vec::new();
                for sample in series.iter() {
                    samples.push(sample);
                    if samples.len() % 4096 == 0 {
                        self.count_samples(4096)?;
                        self.check_deadline("query preparation")?;
                    }
                }
                self.count_samples(samples.len() % 4096)?;
                if !samples.is_empty() {
                    loaded.push(Loaded {
                        labels: series.labels.clone(),
                        samples,
                    });
                }
            }
            self.series.insert(selector_key(vs), loaded);
        }
        self.check_deadline("query preparation")
    }

    /// Evaluate at a single timestamp
    pub fn instant(&self, expr: &Expr, t: Timestamp) -> EvalResult<StepValue> {
        let value = self.eval(expr, t)?;
        if let StepValue::Vector(v) = &value {
            check_unique(v)?;
        }
        self.check_deadline("expression evaluation")?;
        Ok(value)
    }

    /// Evaluate at every step in `[start, end]`, one series per label set
    pub fn range(
        &mut self,
        expr: &Expr,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> EvalResult<Vec<(Labels, Vec<Sample>)>> {
        let mut out: HashMap<Labels, Vec<Sample>> = HashMap::new();
        let mut t = start;
        while t <= end {
            self.check_deadline("expression evaluation")?;
            match self.eval(expr, t)? {
                StepValue::Scalar(v) => {
                    out.entry(Labels::empty()).or_default().push(Sample::new(t, v));
                    self.count_samples(1)?;
                }
                StepValue::Vector(elems) => {
                    check_unique(&elems)?;
                    self.count_samples(elems.len())?;
                    for e in elems {
                        out.entry(e.labels).or_default().push(Sample::new(t, e.v));
                    }
                }
                other => {
                    return Err(QueryError::BadData(format!(
                        "invalid expression type {:?} for range query, must be scalar or instant vector",
                        type_name(&other)
                    )))
                }
            }
            t += step;
        }

        let mut series: Vec<(Labels, Vec<Sample>)> = out.into_iter().collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(series)
    }

    fn eval(&self, expr: &Expr, t: Timestamp) -> EvalResult<StepValue> {
        match expr {
            Expr::Number(n) => Ok(StepValue::Scalar(*n)),
            Expr::String(s) => Ok(StepValue::String(s.clone())),
            Expr::Paren(inner) => self.eval(inner, t),
            Expr::VectorSelector(vs) => Ok(StepValue::Vector(self.instant_selector(vs, t))),
            Expr::MatrixSelector(ms) => Ok(StepValue::Matrix(self.range_selector(ms, t))),
            Expr::Neg(inner) => match self.eval(inner, t)? {
                StepValue::Scalar(v) => Ok(StepValue::Scalar(-v)),
                StepValue::Vector(elems) => Ok(StepValue::Vector(
                    elems
                        .into_iter()
                        .map(|e| Elem {
                            labels: e.labels.without_metric_name(),
                            t,
                            v: -e.v,
                        })
                        .collect(),
                )),
                other => Err(QueryError::exec(format!(
                    "unary minus not defined for {}",
                    type_name(&other)
                ))),
            },
            Expr::Call(call) => self.eval_call(call, t),
            Expr::Aggregate(agg) => {
                let param = match &agg.param {
                    Some(p) => self.eval_scalar(p, t)?,
                    None => 0.0,
                };
                let input = self.eval_vector(&agg.expr, t)?;
                Ok(StepValue::Vector(aggregate(agg.op, param, &agg.grouping, input, t)))
            }
            Expr::Binary(b) => self.eval_binary(b, t),
        }
    }

    fn eval_scalar(&self, expr: &Expr, t: Timestamp) -> EvalResult<f64> {
        match self.eval(expr, t)? {
            StepValue::Scalar(v) => Ok(v),
            other => Err(QueryError::exec(format!("expected scalar, got {}", type_name(&other)))),
        }
    }

    fn eval_vector(&self, expr: &Expr, t: Timestamp) -> EvalResult<Vec<Elem>> {
        match self.eval(expr, t)? {
            StepValue::Vector(v) => Ok(v),
            other => Err(QueryError::exec(format!(
                "expected instant vector, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Latest sample per series in `(t - offset - lookback, t - offset]`
    fn instant_selector(&self, vs: &VectorSelector, t: Timestamp) -> Vec<Elem> {
        let ts = t - vs.offset;
        let Some(series) = self.series.get(&selector_key(vs)) else {
            return Vec::new();
        };
        series
            .iter()
            .filter_map(|s| {
                let idx = s.samples.partition_point(|x| x.t <= ts);
                let sample = s.samples.get(idx.checked_sub(1)?)?;
                if sample.t <= ts - self.lookback {
                    return None;
                }
                Some(Elem {
                    labels: s.labels.clone(),
                    t: sample.t,
                    v: sample.v,
                })
            })
            .collect()
    }

    /// Samples per series in `[t - offset - range, t - offset]`
    fn range_selector(&self, ms: &MatrixSelector, t: Timestamp) -> Vec<RangeElem> {
        let end = t - ms.selector.offset;
        let start = end - ms.range;
        let Some(series) = self.series.get(&selector_key(&ms.selector)) else {
            return Vec::new();
        };
        series
            .iter()
            .filter_map(|s| {
                let lo = s.samples.partition_point(|x| x.t < start);
                let hi = s.samples.partition_point(|x| x.t <= end);
                if lo >= hi {
                    return None;
                }
                Some(RangeElem {
                    labels: s.labels.clone(),
                    samples: s.samples[lo..hi].to_vec(),
                })
            })
            .collect()
    }

    fn eval_call(&self, call: &Call, t: Timestamp) -> EvalResult<StepValue> {
        let name = call.func.name;
        let args = &call.args;
        let value = match name {
            "time" => StepValue::Scalar(t as f64 / 1000.0),
            "vector" => {
                let v = self.eval_scalar(&args[0], t)?;
                StepValue::Vector(vec![Elem {
                    labels: Labels::empty(),
                    t,
                    v,
                }])
            }
            "scalar" => {
                let v = self.eval_vector(&args[0], t)?;
                StepValue::Scalar(if v.len() == 1 { v[0].v } else { f64::NAN })
            }
            "absent" => {
                let present = !self.eval_vector(&args[0], t)?.is_empty();
                StepValue::Vector(absent(present, &args[0], t))
            }
            "absent_over_time" => {
                let present = match self.eval(&args[0], t)? {
                    StepValue::Matrix(m) => !m.is_empty(),
                    other => {
                        return Err(QueryError::exec(format!(
                            "expected range vector, got {}",
                            type_name(&other)
                        )))
                    }
                };
                StepValue::Vector(absent(present, &args[0], t))
            }
            "timestamp" => StepValue::Vector(
                self.eval_vector(&args[0], t)?
                    .into_iter()
                    .map(|e| Elem {
                        labels: e.labels.without_metric_name(),
                        t,
                        v: e.t as f64 / 1000.0,
                    })
                    .collect(),
            ),
            "histogram_quantile" => {
                let q = self.eval_scalar(&args[0], t)?;
                let v = self.eval_vector(&args[1], t)?;
                StepValue::Vector(histogram_quantile(q, v, t))
            }
            "sort" | "sort_desc" => {
                let mut v = self.eval_vector(&args[0], t)?;
                let desc = name == "sort_desc";
                v.sort_by(|a, b| match (a.v.is_nan(), b.v.is_nan()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    _ if desc => b.v.total_cmp(&a.v),
                    _ => a.v.total_cmp(&b.v),
                });
                StepValue::Vector(v)
            }
            "quantile_over_time" => {
                let q = self.eval_scalar(&args[0], t)?;
                self.eval_window_function(name, q, &args[1], t)?
            }
            _ if call.func.arg_types.first() == Some(&ValueType::Matrix) => {
                self.eval_window_function(name, 0.0, &args[0], t)?
            }
            _ => {
                let v = self.eval_vector(&args[0], t)?;
                let mut params = Vec::with_capacity(args.len().saturating_sub(1));
                for arg in &args[1..] {
                    params.push(self.eval_scalar(arg, t)?);
                }
                StepValue::Vector(
                    v.into_iter()
                        .map(|e| Elem {
                            labels: e.labels.without_metric_name(),
                            t,
                            v: functions::math(name, e.v, &params),
                        })
                        .collect(),
                )
            }
        };
        Ok(value)
    }

    fn eval_window_function(&self, name: &str, param: f64, arg: &Expr, t: Timestamp) -> EvalResult<StepValue> {
        let Some(ms) = matrix_selector(arg) else {
            return Err(QueryError::exec(format!(
                "{} requires a range vector selector",
                name
            )));
        };
        let end = t - ms.selector.offset;
        let start = end - ms.range;
        let keep_name = name == "last_over_time";

        let out = self
            .range_selector(ms, t)
            .into_iter()
            .filter_map(|r| {
                let v = functions::over_window(name, &r.samples, start, end, param)?;
                let labels = if keep_name {
                    r.labels
                } else {
                    r.labels.without_metric_name()
                };
                Some(Elem { labels, t, v })
            })
            .collect();
        Ok(StepValue::Vector(out))
    }

    fn eval_binary(&self, b: &Binary, t: Timestamp) -> EvalResult<StepValue> {
        let lhs = self.eval(&b.lhs, t)?;
        let rhs = self.eval(&b.rhs, t)?;
        match (lhs, rhs) {
            (StepValue::Scalar(l), StepValue::Scalar(r)) => {
                let v = if b.op.is_comparison() {
                    bool_value(compare(b.op, l, r))
                } else {
                    arith(b.op, l, r)
                };
                Ok(StepValue::Scalar(v))
            }
            (StepValue::Vector(v), StepValue::Scalar(s)) => {
                Ok(StepValue::Vector(vector_scalar(b, v, s, false, t)))
            }
            (StepValue::Scalar(s), StepValue::Vector(v)) => {
                Ok(StepValue::Vector(vector_scalar(b, v, s, true, t)))
            }
            (StepValue::Vector(l), StepValue::Vector(r)) => {
                Ok(StepValue::Vector(vector_vector(b, l, r, t)?))
            }
            (l, r) => Err(QueryError::exec(format!(
                "binary operator not defined between {} and {}",
                type_name(&l),
                type_name(&r)
            ))),
        }
    }
}

fn type_name(value: &StepValue) -> &'static str {
    match value {
        StepValue::Scalar(_) => "scalar",
        StepValue::String(_) => "string",
        StepValue::Vector(_) => "instant vector",
        StepValue::Matrix(_) => "range vector",
    }
}

fn check_unique(elems: &[Elem]) -> EvalResult<()> {
    let mut seen = HashSet::with_capacity(elems.len());
    for e in elems {
        if !seen.insert(&e.labels) {
            return Err(QueryError::exec(format!(
                "vector cannot contain metrics with the same labelset {}",
                e.labels
            )));
        }
    }
    Ok(())
}

fn matrix_selector(expr: &Expr) -> Option<&MatrixSelector> {
    match expr {
        Expr::MatrixSelector(ms) => Some(ms),
        Expr::Paren(inner) => matrix_selector(inner),
        _ => None,
    }
}

/// `absent` output: 1 labelled with the selector's equality matchers
fn absent(present: bool, arg: &Expr, t: Timestamp) -> Vec<Elem> {
    if present {
        return Vec::new();
    }
    let selector = match arg {
        Expr::VectorSelector(vs) => Some(vs),
        Expr::MatrixSelector(ms) => Some(&ms.selector),
        _ => None,
    };
    let mut builder = Labels::empty().builder();
    if let Some(vs) = selector {
        for m in &vs.matchers {
            if m.op == MatchOp::Equal && m.name != METRIC_NAME_LABEL {
                builder.set(&m.name, &m.value);
            }
        }
    }
    vec![Elem {
        labels: builder.build(),
        t,
        v: 1.0,
    }]
}

fn histogram_quantile(q: f64, input: Vec<Elem>, t: Timestamp) -> Vec<Elem> {
    let le = ["le".to_string()];
    let mut order = Vec::new();
    let mut groups: HashMap<Labels, Vec<(f64, f64)>> = HashMap::new();
    for e in input {
        let Some(bound) = e.labels.get("le").and_then(parse_bound) else {
            continue;
        };
        let key = e.labels.drop_with_name(&le);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push((bound, e.v));
    }
    order
        .into_iter()
        .filter_map(|labels| {
            let mut buckets = groups.remove(&labels)?;
            Some(Elem {
                labels,
                t,
                v: functions::bucket_quantile(q, &mut buckets),
            })
        })
        .collect()
}

fn parse_bound(s: &str) -> Option<f64> {
    if s.eq_ignore_ascii_case("+inf") || s.eq_ignore_ascii_case("inf") {
        return Some(f64::INFINITY);
    }
    s.parse().ok()
}

fn arith(op: BinaryOp, l: f64, r: f64) -> f64 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => l / r,
        BinaryOp::Mod => l % r,
        BinaryOp::Pow => l.powf(r),
        _ => f64::NAN,
    }
}

fn compare(op: BinaryOp, l: f64, r: f64) -> bool {
    match op {
        BinaryOp::Eq => l == r,
        BinaryOp::Ne => l != r,
        BinaryOp::Lt => l < r,
        BinaryOp::Le => l <= r,
        BinaryOp::Gt => l > r,
        BinaryOp::Ge => l >= r,
        _ => false,
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn vector_scalar(b: &Binary, v: Vec<Elem>, s: f64, scalar_left: bool, t: Timestamp) -> Vec<Elem> {
    v.into_iter()
        .filter_map(|e| {
            let (l, r) = if scalar_left { (s, e.v) } else { (e.v, s) };
            if !b.op.is_comparison() {
                return Some(Elem {
                    labels: e.labels.without_metric_name(),
                    t,
                    v: arith(b.op, l, r),
                });
            }
            let ok = compare(b.op, l, r);
            if b.return_bool {
                Some(Elem {
                    labels: e.labels.without_metric_name(),
                    t,
                    v: bool_value(ok),
                })
            } else if ok {
                Some(Elem { labels: e.labels, t, v: e.v })
            } else {
                None
            }
        })
        .collect()
}

fn signature(labels: &Labels, matching: &VectorMatching) -> Labels {
    if matching.on {
        labels.keep(&matching.labels)
    } else {
        labels.drop_with_name(&matching.labels)
    }
}

fn vector_vector(b: &Binary, lhs: Vec<Elem>, rhs: Vec<Elem>, t: Timestamp) -> EvalResult<Vec<Elem>> {
    let matching = &b.matching;
    match b.op {
        BinaryOp::And => {
            let right: HashSet<Labels> = rhs.iter().map(|e| signature(&e.labels, matching)).collect();
            Ok(lhs
                .into_iter()
                .filter(|e| right.contains(&signature(&e.labels, matching)))
                .collect())
        }
        BinaryOp::Unless => {
            let right: HashSet<Labels> = rhs.iter().map(|e| signature(&e.labels, matching)).collect();
            Ok(lhs
                .into_iter()
                .filter(|e| !right.contains(&signature(&e.labels, matching)))
                .collect())
        }
        BinaryOp::Or => {
            let left: HashSet<Labels> = lhs.iter().map(|e| signature(&e.labels, matching)).collect();
            let mut out = lhs;
            out.extend(
                rhs.into_iter()
                    .filter(|e| !left.contains(&signature(&e.labels, matching))),
            );
            Ok(out)
        }
        _ => match_vectors(b, lhs, rhs, t),
    }
}

/// Arithmetic and comparison between two vectors
fn match_vectors(b: &Binary, lhs: Vec<Elem>, rhs: Vec<Elem>, t: Timestamp) -> EvalResult<Vec<Elem>> {
    let matching = &b.matching;
    let swapped = matches!(matching.card, Cardinality::OneToMany(_));
    let (many, one) = if swapped { (rhs, lhs) } else { (lhs, rhs) };

    let mut one_side: HashMap<Labels, Elem> = HashMap::with_capacity(one.len());
    for e in one {
        let sig = signature(&e.labels, matching);
        if one_side.contains_key(&sig) {
            return Err(QueryError::exec(format!(
                "found duplicate series for the match group {} on the {} hand-side of the operation; \
                 many-to-many matching not allowed: matching labels must be unique on one side",
                sig,
                if swapped { "left" } else { "right" }
            )));
        }
        one_side.insert(sig, e);
    }

    let one_to_one = matching.card == Cardinality::OneToOne;
    let mut matched: HashSet<Labels> = HashSet::new();
    let mut produced: HashSet<Labels> = HashSet::new();
    let mut out = Vec::new();
    for m in many {
        let sig = signature(&m.labels, matching);
        let Some(o) = one_side.get(&sig) else {
            continue;
        };
        if one_to_one && !matched.insert(sig) {
            return Err(QueryError::exec(
                "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)",
            ));
        }

        let (l, r) = if swapped { (o.v, m.v) } else { (m.v, o.v) };
        let v = if b.op.is_comparison() {
            let ok = compare(b.op, l, r);
            if b.return_bool {
                bool_value(ok)
            } else if ok {
                l
            } else {
                continue;
            }
        } else {
            arith(b.op, l, r)
        };

        let labels = result_labels(&m.labels, &o.labels, b);
        if !one_to_one && !produced.insert(labels.clone()) {
            return Err(QueryError::exec(
                "multiple matches for labels: grouping labels must ensure unique matches",
            ));
        }
        out.push(Elem { labels, t, v });
    }
    Ok(out)
}

fn result_labels(many: &Labels, one: &Labels, b: &Binary) -> Labels {
    let matching = &b.matching;
    let mut builder = many.builder();
    if !b.op.is_comparison() || b.return_bool {
        builder.del(METRIC_NAME_LABEL);
    }
    match &matching.card {
        Cardinality::OneToOne => {
            for label in many.iter() {
                let listed = matching.labels.contains(&label.name);
                if listed != matching.on {
                    builder.del(&label.name);
                }
            }
        }
        Cardinality::ManyToOne(include) | Cardinality::OneToMany(include) => {
            for name in include {
                match one.get(name) {
                    Some(value) => builder.set(name, value),
                    None => builder.del(name),
                };
            }
        }
        Cardinality::ManyToMany => {}
    }
    builder.build()
}
