//! Builtin function table and the per-window math behind it

use super::ast::{Function, ValueType};
use crate::{Sample, Timestamp};

use ValueType::{Matrix, Scalar, Vector};

const fn func(
    name: &'static str,
    arg_types: &'static [ValueType],
    optional_args: usize,
    return_type: ValueType,
) -> Function {
    Function {
        name,
        arg_types,
        optional_args,
        return_type,
    }
}

static FUNCTIONS: &[Function] = &[
    func("rate", &[Matrix], 0, Vector),
    func("increase", &[Matrix], 0, Vector),
    func("delta", &[Matrix], 0, Vector),
    func("irate", &[Matrix], 0, Vector),
    func("idelta", &[Matrix], 0, Vector),
    func("resets", &[Matrix], 0, Vector),
    func("changes", &[Matrix], 0, Vector),
    func("avg_over_time", &[Matrix], 0, Vector),
    func("min_over_time", &[Matrix], 0, Vector),
    func("max_over_time", &[Matrix], 0, Vector),
    func("sum_over_time", &[Matrix], 0, Vector),
    func("count_over_time", &[Matrix], 0, Vector),
    func("last_over_time", &[Matrix], 0, Vector),
    func("stddev_over_time", &[Matrix], 0, Vector),
    func("stdvar_over_time", &[Matrix], 0, Vector),
    func("quantile_over_time", &[Scalar, Matrix], 0, Vector),
    func("absent_over_time", &[Matrix], 0, Vector),
    func("abs", &[Vector], 0, Vector),
    func("ceil", &[Vector], 0, Vector),
    func("floor", &[Vector], 0, Vector),
    func("round", &[Vector, Scalar], 1, Vector),
    func("sqrt", &[Vector], 0, Vector),
    func("exp", &[Vector], 0, Vector),
    func("ln", &[Vector], 0, Vector),
    func("log2", &[Vector], 0, Vector),
    func("log10", &[Vector], 0, Vector),
    func("clamp", &[Vector, Scalar, Scalar], 0, Vector),
    func("clamp_min", &[Vector, Scalar], 0, Vector),
    func("clamp_max", &[Vector, Scalar], 0, Vector),
    func("time", &[], 0, Scalar),
    func("timestamp", &[Vector], 0, Vector),
    func("vector", &[Scalar], 0, Vector),
    func("scalar", &[Vector], 0, Scalar),
    func("absent", &[Vector], 0, Vector),
    func("histogram_quantile", &[Scalar, Vector], 0, Vector),
    func("sort", &[Vector], 0, Vector),
    func("sort_desc", &[Vector], 0, Vector),
];

pub fn lookup(name: &str) -> Option<Function> {
    FUNCTIONS.iter().find(|f| f.name == name).copied()
}

/// Evaluate a range-vector function over the samples of one window.
///
/// `range_start..=range_end` is the selector window. Returns `None` when
/// the window does not hold enough samples for the function.
pub(crate) fn over_window(
    name: &str,
    samples: &[Sample],
    range_start: Timestamp,
    range_end: Timestamp,
    param: f64,
) -> Option<f64> {
    let last = samples.last()?;
    match name {
        "rate" => extrapolated_delta(samples, range_start, range_end, true, true),
        "increase" => extrapolated_delta(samples, range_start, range_end, true, false),
        "delta" => extrapolated_delta(samples, range_start, range_end, false, false),
        "irate" => instant_delta(samples, true),
        "idelta" => instant_delta(samples, false),
        "resets" => Some(samples.windows(2).filter(|w| w[1].v < w[0].v).count() as f64),
        "changes" => Some(
            samples
                .windows(2)
                .filter(|w| w[1].v != w[0].v && !(w[1].v.is_nan() && w[0].v.is_nan()))
                .count() as f64,
        ),
        "avg_over_time" => {
            let mut mean = 0.0;
            for (i, s) in samples.iter().enumerate() {
                mean += (s.v - mean) / (i + 1) as f64;
            }
            Some(mean)
        }
        "min_over_time" => Some(fold_nan_aware(samples, f64::min)),
        "max_over_time" => Some(fold_nan_aware(samples, f64::max)),
        "sum_over_time" => Some(samples.iter().map(|s| s.v).sum()),
        "count_over_time" => Some(samples.len() as f64),
        "last_over_time" => Some(last.v),
        "stdvar_over_time" => Some(variance(samples.iter().map(|s| s.v))),
        "stddev_over_time" => Some(variance(samples.iter().map(|s| s.v)).sqrt()),
        "quantile_over_time" => {
            let mut values: Vec<f64> = samples.iter().map(|s| s.v).collect();
            Some(quantile(param, &mut values))
        }
        _ => None,
    }
}

/// min/max that only return NaN when every value is NaN
fn fold_nan_aware(samples: &[Sample], f: fn(f64, f64) -> f64) -> f64 {
    samples
        .iter()
        .map(|s| s.v)
        .reduce(|acc, v| if acc.is_nan() { v } else { f(acc, v) })
        .unwrap_or(f64::NAN)
}

/// Population variance
pub(crate) fn variance(values: impl Iterator<Item = f64>) -> f64 {
    let mut count = 0.0;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for v in values {
        count += 1.0;
        let delta = v - mean;
        mean += delta / count;
        m2 += delta * (v - mean);
    }
    if count == 0.0 {
        f64::NAN
    } else {
        m2 / count
    }
}

/// Quantile with linear interpolation between closest ranks
pub(crate) fn quantile(q: f64, values: &mut [f64]) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let rank = q * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let weight = rank - lower as f64;
    values[lower] * (1.0 - weight) + values[upper] * weight
}

/// Delta over the window, compensating counter resets and extrapolating
/// towards the window edges.
fn extrapolated_delta(
    samples: &[Sample],
    range_start: Timestamp,
    range_end: Timestamp,
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];

    let mut result = last.v - first.v;
    if is_counter {
        // a drop means the counter restarted from zero
        for w in samples.windows(2) {
            if w[1].v < w[0].v {
                result += w[0].v;
            }
        }
    }

    let sampled_interval = (last.t - first.t) as f64 / 1000.0;
    if sampled_interval <= 0.0 {
        return None;
    }
    let average_between = sampled_interval / (samples.len() - 1) as f64;
    let mut to_start = (first.t - range_start) as f64 / 1000.0;
    let to_end = (range_end - last.t) as f64 / 1000.0;

    // counters cannot go below zero, so do not extrapolate past that point
    if is_counter && result > 0.0 && first.v >= 0.0 {
        let to_zero = sampled_interval * (first.v / result);
        if to_zero < to_start {
            to_start = to_zero;
        }
    }

    let threshold = average_between * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if to_start < threshold { to_start } else { average_between / 2.0 };
    extrapolate_to += if to_end < threshold { to_end } else { average_between / 2.0 };

    result *= extrapolate_to / sampled_interval;
    if is_rate {
        let range_secs = (range_end - range_start) as f64 / 1000.0;
        if range_secs <= 0.0 {
            return None;
        }
        result /= range_secs;
    }
    Some(result)
}

/// Difference between the last two samples
fn instant_delta(samples: &[Sample], is_rate: bool) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let last = samples[samples.len() - 1];
    let prev = samples[samples.len() - 2];

    let result = if is_rate && last.v < prev.v {
        // reset: the counter climbed from zero to last.v
        last.v
    } else {
        last.v - prev.v
    };
    if !is_rate {
        return Some(result);
    }
    let interval = (last.t - prev.t) as f64 / 1000.0;
    if interval <= 0.0 {
        return None;
    }
    Some(result / interval)
}

/// Element-wise math functions
pub(crate) fn math(name: &str, v: f64, args: &[f64]) -> f64 {
    match name {
        "abs" => v.abs(),
        "ceil" => v.ceil(),
        "floor" => v.floor(),
        "round" => {
            let to_nearest = args.first().copied().unwrap_or(1.0);
            let inverse = 1.0 / to_nearest;
            (v * inverse + 0.5).floor() / inverse
        }
        "sqrt" => v.sqrt(),
        "exp" => v.exp(),
        "ln" => v.ln(),
        "log2" => v.log2(),
        "log10" => v.log10(),
        "clamp_min" => v.max(args[0]),
        "clamp_max" => v.min(args[0]),
        "clamp" => v.max(args[0]).min(args[1]),
        _ => f64::NAN,
    }
}

/// Quantile from cumulative `(upper bound, count)` buckets
pub(crate) fn bucket_quantile(q: f64, buckets: &mut Vec<(f64, f64)>) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    match buckets.last() {
        Some((upper, _)) if upper.is_infinite() && *upper > 0.0 => {}
        _ => return f64::NAN,
    }
    // scraping may observe buckets at slightly different moments
    for i in 1..buckets.len() {
        if buckets[i].1 < buckets[i - 1].1 {
            buckets[i].1 = buckets[i - 1].1;
        }
    }
    if buckets.len() < 2 {
        return f64::NAN;
    }
    let observations = buckets[buckets.len() - 1].1;
    if observations == 0.0 {
        return f64::NAN;
    }

    let mut rank = q * observations;
    let b = buckets
        .iter()
        .position(|(_, count)| *count >= rank)
        .unwrap_or(buckets.len() - 1);

    if b == buckets.len() - 1 {
        return buckets[buckets.len() - 2].0;
    }
    if b == 0 && buckets[0].0 <= 0.0 {
        return buckets[0].0;
    }

    let mut bucket_start = 0.0;
    let bucket_end = buckets[b].0;
    let mut count = buckets[b].1;
    if b > 0 {
        bucket_start = buckets[b - 1].0;
        count -= buckets[b - 1].1;
        rank -= buckets[b - 1].1;
    }
    bucket_start + (bucket_end - bucket_start) * (rank / count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(points: &[(i64, f64)]) -> Vec<Sample> {
        points.iter().map(|(t, v)| Sample::new(*t, *v)).collect()
    }

    #[test]
    fn test_rate_two_samples() {
        let samples = series(&[(0, 10.0), (60_000, 15.0)]);
        let rate = over_window("rate", &samples, 0, 60_000, 0.0).unwrap();
        assert!((rate - 5.0 / 60.0).abs() < 1e-9, "rate = {}", rate);
        let increase = over_window("increase", &samples, 0, 60_000, 0.0).unwrap();
        assert!((increase - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_compensates_resets() {
        let samples = series(&[(0, 100.0), (15_000, 120.0), (30_000, 5.0), (45_000, 20.0), (60_000, 40.0)]);
        let rate = over_window("rate", &samples, 0, 60_000, 0.0).unwrap();
        assert!(rate > 0.0);
        // 20 before the reset, 40 after it
        let increase = over_window("increase", &samples, 0, 60_000, 0.0).unwrap();
        assert!((increase - 60.0).abs() < 1e-9, "increase = {}", increase);
        assert_eq!(over_window("resets", &samples, 0, 60_000, 0.0), Some(1.0));
        assert!(over_window("irate", &series(&[(0, 50.0), (10_000, 3.0)]), 0, 10_000, 0.0).unwrap() > 0.0);
    }

    #[test]
    fn test_rate_needs_two_samples() {
        assert_eq!(over_window("rate", &series(&[(0, 1.0)]), 0, 60_000, 0.0), None);
        assert_eq!(over_window("count_over_time", &series(&[(0, 1.0)]), 0, 60_000, 0.0), Some(1.0));
    }

    #[test]
    fn test_over_time_family() {
        let samples = series(&[(0, 1.0), (1000, 2.0), (2000, 3.0), (3000, 4.0)]);
        let eval = |name: &str| over_window(name, &samples, 0, 3000, 0.5).unwrap();
        assert_eq!(eval("avg_over_time"), 2.5);
        assert_eq!(eval("min_over_time"), 1.0);
        assert_eq!(eval("max_over_time"), 4.0);
        assert_eq!(eval("sum_over_time"), 10.0);
        assert_eq!(eval("last_over_time"), 4.0);
        assert_eq!(eval("stdvar_over_time"), 1.25);
        assert_eq!(eval("quantile_over_time"), 2.5);
        assert_eq!(eval("changes"), 3.0);
    }

    #[test]
    fn test_bucket_quantile() {
        let mut buckets = vec![(0.1, 10.0), (0.5, 50.0), (1.0, 90.0), (f64::INFINITY, 100.0)];
        let median = bucket_quantile(0.5, &mut buckets);
        assert!((median - 0.5).abs() < 1e-9);
        let p90 = bucket_quantile(0.9, &mut buckets);
        assert!((p90 - 1.0).abs() < 1e-9);
        // above the last finite bucket
        assert_eq!(bucket_quantile(0.99, &mut buckets), 1.0);

        let mut no_inf = vec![(0.1, 1.0), (0.5, 2.0)];
        assert!(bucket_quantile(0.5, &mut no_inf).is_nan());
    }

    #[test]
    fn test_math() {
        assert_eq!(math("round", 2.5, &[]), 3.0);
        assert_eq!(math("round", 17.0, &[5.0]), 15.0);
        assert_eq!(math("clamp", 12.0, &[0.0, 10.0]), 10.0);
        assert_eq!(math("clamp_min", -1.0, &[0.0]), 0.0);
    }
}
