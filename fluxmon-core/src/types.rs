//! Core types for FluxMon

use crate::{Error, Result};
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Dense series reference assigned by the series index
pub type SeriesRef = u32;

/// Reserved label holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// A single (timestamp, value) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub t: Timestamp,
    pub v: f64,
}

impl Sample {
    pub fn new(t: Timestamp, v: f64) -> Self {
        Self { t, v }
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && self.end >= start
    }
}

/// One name/value pair of a label set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Immutable label set, kept sorted by name.
///
/// Equality, ordering and hashing are structural, so a `Labels` value can
/// be used directly as a map key for series identity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Arc<[Label]>);

impl Labels {
    /// Build from arbitrary pairs; sorts but does not validate
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        Self(labels.into())
    }

    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(k, v)| Label::new(k.as_ref(), v.as_ref()))
                .collect(),
        )
    }

    /// Reject duplicate names, empty names and a missing metric name
    pub fn validate(&self) -> Result<()> {
        let mut prev: Option<&str> = None;
        for label in self.0.iter() {
            if label.name.is_empty() {
                return Err(Error::InvalidLabels(format!("empty label name in {}", self)));
            }
            if prev == Some(label.name.as_str()) {
                return Err(Error::InvalidLabels(format!(
                    "duplicate label name {:?} in {}",
                    label.name, self
                )));
            }
            prev = Some(label.name.as_str());
        }
        match self.get(METRIC_NAME_LABEL) {
            Some(name) if !name.is_empty() => Ok(()),
            _ => Err(Error::InvalidLabels(format!("empty metric name in {}", self))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the named labels
    pub fn keep(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    /// Drop the named labels and the metric name
    pub fn drop_with_name(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME_LABEL && !names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    pub fn without_metric_name(&self) -> Labels {
        if self.get(METRIC_NAME_LABEL).is_none() {
            return self.clone();
        }
        self.drop_with_name(&[])
    }

    pub fn builder(&self) -> LabelsBuilder {
        LabelsBuilder {
            labels: self.0.to_vec(),
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.0.iter().map(|l| l.name.len() + l.value.len()).sum()
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            write!(f, "{}", name)?;
        }
        write!(f, "{{")?;
        let mut first = true;
        for label in self.0.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in self.0.iter() {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Labels {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct LabelsVisitor;

        impl<'de> Visitor<'de> for LabelsVisitor {
            type Value = Labels;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Labels, A::Error> {
                let mut labels = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    labels.push(Label { name, value });
                }
                Ok(Labels::new(labels))
            }
        }

        deserializer.deserialize_map(LabelsVisitor)
    }
}

/// Mutable staging area for deriving a new label set
#[derive(Debug, Clone, Default)]
pub struct LabelsBuilder {
    labels: Vec<Label>,
}

impl LabelsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a label; an empty value removes it
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        if value.is_empty() {
            return self.del(name);
        }
        match self.labels.iter_mut().find(|l| l.name == name) {
            Some(label) => label.value = value.to_string(),
            None => self.labels.push(Label::new(name, value)),
        }
        self
    }

    pub fn del(&mut self, name: &str) -> &mut Self {
        self.labels.retain(|l| l.name != name);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn build(&self) -> Labels {
        Labels::new(self.labels.clone())
    }
}

/// Label matching operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        };
        f.write_str(s)
    }
}

/// A single label matcher such as `job=~"api|web"`.
///
/// Regular expressions are fully anchored. A series without the label is
/// treated as having the empty value.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let re = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&format!("^(?:{})$", value))
                    .map_err(|e| Error::InvalidFormat(format!("invalid regex {:?}: {}", value, e)))?,
            ),
            _ => None,
        };
        Ok(Self {
            name: name.into(),
            op,
            value,
            re,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            re: None,
        }
    }

    pub fn metric_name(name: impl Into<String>) -> Self {
        Self::equal(METRIC_NAME_LABEL, name)
    }

    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Equal => self.value == value,
            MatchOp::NotEqual => self.value != value,
            MatchOp::Regex => self.re.as_ref().map_or(false, |re| re.is_match(value)),
            MatchOp::NotRegex => self.re.as_ref().map_or(true, |re| !re.is_match(value)),
        }
    }

    /// True when a series lacking the label would match
    pub fn matches_empty(&self) -> bool {
        self.matches("")
    }

    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Check that every matcher accepts the label set
pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches_labels(labels))
}

/// Distinct label names across a set of label sets, sorted
pub fn label_names<'a>(sets: impl IntoIterator<Item = &'a Labels>) -> Vec<String> {
    let mut names: HashSet<&str> = HashSet::new();
    for labels in sets {
        for l in labels.iter() {
            names.insert(&l.name);
        }
    }
    let mut out: Vec<String> = names.into_iter().map(String::from).collect();
    out.sort();
    out
}
