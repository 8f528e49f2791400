//! Wire formats shared by the HTTP handlers
//!
//! Request parameters follow the Prometheus HTTP API conventions: times are
//! unix seconds (fractional allowed) or RFC 3339, durations are seconds or
//! a duration literal such as `30s` or `1h30m`. Self-monitoring counters are
//! rendered in the text exposition format.

use fluxmon_core::{query, Timestamp};
use std::fmt::Write;
use std::time::Duration;

/// Parse a time parameter into milliseconds
pub fn parse_time(s: &str) -> Result<Timestamp, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() {
            return Err(format!("cannot parse {:?} to a valid timestamp", s));
        }
        return Ok((secs * 1000.0).round() as Timestamp);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| format!("cannot parse {:?} to a valid timestamp", s))
}

/// Parse a duration parameter into milliseconds
pub fn parse_duration(s: &str) -> Result<Timestamp, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("cannot parse {:?} to a valid duration", s));
        }
        return Ok((secs * 1000.0).round() as Timestamp);
    }
    query::parse_duration(s).map_err(|_| format!("cannot parse {:?} to a valid duration", s))
}

/// Parse a request timeout
pub fn parse_timeout(s: &str) -> Result<Duration, String> {
    let ms = parse_duration(s)?;
    if ms <= 0 {
        return Err(format!("timeout must be positive: {:?}", s));
    }
    Ok(Duration::from_millis(ms as u64))
}

/// Sample value as the API encodes it
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

/// Millisecond timestamp as fractional unix seconds
pub fn format_time(t: Timestamp) -> f64 {
    t as f64 / 1000.0
}

/// Metric kinds the exposition writer emits
#[derive(Debug, Clone, Copy)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Builds a text exposition payload
#[derive(Default)]
pub struct ExpositionWriter {
    out: String,
}

impl ExpositionWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one unlabelled metric with its HELP and TYPE lines
    pub fn metric(&mut self, name: &str, kind: MetricKind, help: &str, value: f64) -> &mut Self {
        let _ = writeln!(self.out, "# HELP {} {}", name, help);
        let _ = writeln!(self.out, "# TYPE {} {}", name, kind.as_str());
        let _ = writeln!(self.out, "{} {}", name, format_value(value));
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}
