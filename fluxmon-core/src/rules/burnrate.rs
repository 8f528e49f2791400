//! Multi-window, multi-burn-rate alerts for service level objectives.
//!
//! A burn rate of 1 consumes exactly the error budget over the SLO
//! period. Each window pair alerts when both the long and the short
//! window burn faster than the pair's factor; the short window makes the
//! alert reset quickly once the burn stops.

use super::alerting::AlertingRule;
use crate::{Error, Result, Timestamp};
use std::collections::BTreeMap;

/// Placeholder replaced by each window in the error ratio expression
pub const WINDOW_PLACEHOLDER: &str = "$window";

/// One long/short window pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurnWindow {
    pub long_ms: Timestamp,
    pub short_ms: Timestamp,
    pub factor: f64,
    pub for_ms: Timestamp,
    pub severity: &'static str,
}

const MINUTE: Timestamp = 60_000;
const HOUR: Timestamp = 60 * MINUTE;

/// Standard window pairs for a 30 day objective
pub const BURN_WINDOWS: [BurnWindow; 3] = [
    BurnWindow {
        long_ms: HOUR,
        short_ms: 5 * MINUTE,
        factor: 14.4,
        for_ms: 2 * MINUTE,
        severity: "page",
    },
    BurnWindow {
        long_ms: 6 * HOUR,
        short_ms: 30 * MINUTE,
        factor: 6.0,
        for_ms: 15 * MINUTE,
        severity: "page",
    },
    BurnWindow {
        long_ms: 72 * HOUR,
        short_ms: 6 * HOUR,
        factor: 1.0,
        for_ms: HOUR,
        severity: "ticket",
    },
];

/// A service level objective to alert on
#[derive(Debug, Clone, PartialEq)]
pub struct Slo {
    pub name: String,
    /// Ratio of failed to total events over `$window`
    pub error_ratio: String,
    /// Target success ratio, e.g. `0.999`
    pub objective: f64,
    pub labels: BTreeMap<String, String>,
}

impl Slo {
    pub fn validate(&self) -> Result<()> {
        if !(self.objective > 0.0 && self.objective < 1.0) {
            return Err(Error::Config(format!(
                "slo {}: objective must be between 0 and 1, got {}",
                self.name, self.objective
            )));
        }
        if !self.error_ratio.contains(WINDOW_PLACEHOLDER) {
            return Err(Error::Config(format!(
                "slo {}: error ratio must reference {}",
                self.name, WINDOW_PLACEHOLDER
            )));
        }
        Ok(())
    }

    pub fn error_budget(&self) -> f64 {
        1.0 - self.objective
    }

    /// Expand into one alerting rule per window pair
    pub fn alerting_rules(&self) -> Result<Vec<AlertingRule>> {
        self.validate()?;
        let budget = self.error_budget();

        BURN_WINDOWS
            .iter()
            .map(|w| {
                let long = format_duration(w.long_ms);
                let short = format_duration(w.short_ms);
                let threshold = w.factor * budget;
                let expr = format!(
                    "({}) > {} and ({}) > {}",
                    self.error_ratio.replace(WINDOW_PLACEHOLDER, &long),
                    threshold,
                    self.error_ratio.replace(WINDOW_PLACEHOLDER, &short),
                    threshold,
                );

                let mut labels = self.labels.clone();
                labels.insert("slo".into(), self.name.clone());
                labels.insert("severity".into(), w.severity.into());
                labels.insert("long_window".into(), long.clone());
                labels.insert("short_window".into(), short.clone());

                let annotations = BTreeMap::from([
                    (
                        "summary".to_string(),
                        format!("{} is burning its error budget {}x too fast", self.name, w.factor),
                    ),
                    (
                        "description".to_string(),
                        format!(
                            "Error ratio over {} is {{{{ $value | humanizePercentage }}}}, above {} ({}x of a {} budget)",
                            long,
                            threshold,
                            w.factor,
                            budget
                        ),
                    ),
                ]);

                AlertingRule::new(
                    format!("{}ErrorBudgetBurn", self.name),
                    expr,
                    w.for_ms,
                    labels,
                    annotations,
                )
            })
            .collect()
    }
}

/// Largest-unit-first duration literal, e.g. `1h30m`
pub fn format_duration(ms: Timestamp) -> String {
    if ms == 0 {
        return "0s".into();
    }
    const UNITS: [(&str, Timestamp); 6] = [
        ("d", 24 * HOUR),
        ("h", HOUR),
        ("m", MINUTE),
        ("s", 1_000),
        ("ms", 1),
        ("", 0),
    ];
    let mut rest = ms;
    let mut out = String::new();
    for (unit, size) in UNITS {
        if size == 0 || rest == 0 {
            break;
        }
        if rest >= size {
            out.push_str(&format!("{}{}", rest / size, unit));
            rest %= size;
        }
    }
    out
}
