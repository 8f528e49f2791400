//! Aggregation operators over instant vectors

use super::ast::{AggregateOp, Grouping};
use super::eval::Elem;
use super::functions::quantile;
use crate::{Labels, Timestamp};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Accumulator for computing one group's value incrementally
pub trait Accumulator: Send {
    fn add(&mut self, value: f64);

    /// `None` when nothing was added
    fn result(&mut self) -> Option<f64>;
}

#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _value: f64) {
        self.count += 1;
    }

    fn result(&mut self) -> Option<f64> {
        (self.count > 0).then_some(self.count as f64)
    }
}

/// Always 1 for a non-empty group
#[derive(Debug, Default)]
pub struct GroupAccumulator {
    seen: bool,
}

impl Accumulator for GroupAccumulator {
    fn add(&mut self, _value: f64) {
        self.seen = true;
    }

    fn result(&mut self) -> Option<f64> {
        self.seen.then_some(1.0)
    }
}

#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&mut self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }
}

/// Incremental mean, stable for large values
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    mean: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, value: f64) {
        self.count += 1;
        if self.mean.is_infinite() && value.is_infinite() {
            if self.mean.signum() != value.signum() {
                self.mean = f64::NAN;
            }
            return;
        }
        self.mean += (value - self.mean) / self.count as f64;
    }

    fn result(&mut self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }
}

/// Min accumulator; NaN only wins when every input is NaN
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, value: f64) {
        self.min = Some(match self.min {
            Some(current) if !current.is_nan() => current.min(value),
            _ => value,
        });
    }

    fn result(&mut self) -> Option<f64> {
        self.min
    }
}

#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, value: f64) {
        self.max = Some(match self.max {
            Some(current) if !current.is_nan() => current.max(value),
            _ => value,
        });
    }

    fn result(&mut self) -> Option<f64> {
        self.max
    }
}

/// Population variance or standard deviation (Welford's algorithm)
#[derive(Debug, Default)]
pub struct VarianceAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    stddev: bool,
}

impl VarianceAccumulator {
    pub fn stddev() -> Self {
        Self {
            stddev: true,
            ..Default::default()
        }
    }
}

impl Accumulator for VarianceAccumulator {
    fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn result(&mut self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let variance = self.m2 / self.count as f64;
        Some(if self.stddev { variance.sqrt() } else { variance })
    }
}

#[derive(Debug, Default)]
pub struct QuantileAccumulator {
    q: f64,
    values: Vec<f64>,
}

impl QuantileAccumulator {
    pub fn new(q: f64) -> Self {
        Self { q, values: Vec::new() }
    }
}

impl Accumulator for QuantileAccumulator {
    fn add(&mut self, value: f64) {
        self.values.push(value);
    }

    fn result(&mut self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(quantile(self.q, &mut self.values))
    }
}

fn accumulator(op: AggregateOp, param: f64) -> Box<dyn Accumulator> {
    match op {
        AggregateOp::Sum => Box::<SumAccumulator>::default(),
        AggregateOp::Avg => Box::<MeanAccumulator>::default(),
        AggregateOp::Min => Box::<MinAccumulator>::default(),
        AggregateOp::Max => Box::<MaxAccumulator>::default(),
        AggregateOp::Count => Box::<CountAccumulator>::default(),
        AggregateOp::Group => Box::<GroupAccumulator>::default(),
        AggregateOp::Stddev => Box::new(VarianceAccumulator::stddev()),
        AggregateOp::Stdvar => Box::<VarianceAccumulator>::default(),
        AggregateOp::Quantile => Box::new(QuantileAccumulator::new(param)),
        // selection operators are handled without an accumulator
        AggregateOp::Topk | AggregateOp::Bottomk => Box::<CountAccumulator>::default(),
    }
}

/// Label set identifying an element's group
pub(crate) fn group_key(labels: &Labels, grouping: &Option<Grouping>) -> Labels {
    match grouping {
        None => Labels::empty(),
        Some(Grouping::By(names)) => labels.keep(names),
        Some(Grouping::Without(names)) => labels.drop_with_name(names),
    }
}

/// Apply an aggregation at evaluation time `t`
pub(crate) fn aggregate(
    op: AggregateOp,
    param: f64,
    grouping: &Option<Grouping>,
    input: Vec<Elem>,
    t: Timestamp,
) -> Vec<Elem> {
    if matches!(op, AggregateOp::Topk | AggregateOp::Bottomk) {
        return select_k(op == AggregateOp::Topk, param, grouping, input);
    }

    let mut order: Vec<Labels> = Vec::new();
    let mut groups: HashMap<Labels, Box<dyn Accumulator>> = HashMap::new();
    for elem in input {
        let key = group_key(&elem.labels, grouping);
        let acc = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            accumulator(op, param)
        });
        acc.add(elem.v);
    }

    order
        .into_iter()
        .filter_map(|labels| {
            let v = groups.get_mut(&labels)?.result()?;
            Some(Elem { labels, t, v })
        })
        .collect()
}

/// topk / bottomk keep the original elements
fn select_k(top: bool, k: f64, grouping: &Option<Grouping>, input: Vec<Elem>) -> Vec<Elem> {
    if k.is_nan() || k < 1.0 {
        return Vec::new();
    }
    let k = k as usize;

    let mut order: Vec<Labels> = Vec::new();
    let mut groups: HashMap<Labels, Vec<Elem>> = HashMap::new();
    for elem in input {
        let key = group_key(&elem.labels, grouping);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(elem);
    }

    // NaN always sorts last
    let compare = |a: &Elem, b: &Elem| -> Ordering {
        match (a.v.is_nan(), b.v.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ if top => b.v.total_cmp(&a.v),
            _ => a.v.total_cmp(&b.v),
        }
    };

    let mut out = Vec::new();
    for key in order {
        if let Some(mut members) = groups.remove(&key) {
            members.sort_by(compare);
            members.truncate(k);
            out.extend(members);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(pairs: &[(&str, &str)], v: f64) -> Elem {
        Elem {
            labels: Labels::from_pairs(pairs),
            t: 0,
            v,
        }
    }

    fn up_vector() -> Vec<Elem> {
        vec![
            elem(&[("__name__", "up"), ("job", "x"), ("instance", "1")], 1.0),
            elem(&[("__name__", "up"), ("job", "x"), ("instance", "2")], 0.0),
            elem(&[("__name__", "up"), ("job", "y"), ("instance", "1")], 1.0),
        ]
    }

    #[test]
    fn test_mean_accumulator() {
        let mut acc = MeanAccumulator::default();
        acc.add(10.0);
        acc.add(20.0);
        acc.add(30.0);
        assert_eq!(acc.result(), Some(20.0));
    }

    #[test]
    fn test_min_max_accumulator() {
        let mut min_acc = MinAccumulator::default();
        let mut max_acc = MaxAccumulator::default();

        for v in [f64::NAN, 5.0, 2.0, 8.0, 1.0, 9.0] {
            min_acc.add(v);
            max_acc.add(v);
        }

        assert_eq!(min_acc.result(), Some(1.0));
        assert_eq!(max_acc.result(), Some(9.0));
    }

    #[test]
    fn test_stddev_accumulator() {
        let mut acc = VarianceAccumulator::stddev();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add(v);
        }
        let stddev = acc.result().unwrap();
        assert!((stddev - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_sum_by_job() {
        let grouping = Some(Grouping::By(vec!["job".into()]));
        let mut out = aggregate(AggregateOp::Sum, 0.0, &grouping, up_vector(), 1000);
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].labels, Labels::from_pairs(&[("job", "x")]));
        assert_eq!(out[0].v, 1.0);
        assert_eq!(out[1].labels, Labels::from_pairs(&[("job", "y")]));
        assert_eq!(out[1].v, 1.0);
    }

    #[test]
    fn test_without_drops_metric_name() {
        let grouping = Some(Grouping::Without(vec!["instance".into()]));
        let out = aggregate(AggregateOp::Count, 0.0, &grouping, up_vector(), 0);
        assert!(out.iter().all(|e| e.labels.metric_name().is_none()));
        assert_eq!(out.iter().map(|e| e.v).sum::<f64>(), 3.0);
    }

    #[test]
    fn test_topk_keeps_labels() {
        let out = aggregate(AggregateOp::Topk, 1.0, &None, up_vector(), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].v, 1.0);
        assert_eq!(out[0].labels.metric_name(), Some("up"));

        let out = aggregate(AggregateOp::Bottomk, 2.0, &None, up_vector(), 0);
        assert_eq!(out[0].v, 0.0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_quantile() {
        let out = aggregate(AggregateOp::Quantile, 0.5, &None, up_vector(), 0);
        assert_eq!(out[0].v, 1.0);
    }
}
