//! Series index
//!
//! Maps label sets to series references and keeps an inverted index
//! (label name -> value -> bitmap of references) for matcher lookups.
//! References are handed out in increasing order and never reused, so a
//! removed series that comes back gets a fresh one.

use crate::{Labels, MatchOp, Matcher, Result, SeriesRef, Error};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::collections::{BTreeSet, HashMap};

/// Inverted index from label pairs to series ids
#[derive(Debug, Default, Clone)]
pub struct Postings {
    by_label: HashMap<String, HashMap<String, RoaringBitmap>>,
    all: RoaringBitmap,
}

impl Postings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: u32, labels: &Labels) {
        for label in labels.iter() {
            self.by_label
                .entry(label.name.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .insert(id);
        }
        self.all.insert(id);
    }

    /// Drop `id`, along with label values and names no series uses anymore
    pub fn remove(&mut self, id: u32, labels: &Labels) {
        for label in labels.iter() {
            let Some(values) = self.by_label.get_mut(&label.name) else {
                continue;
            };
            if let Some(ids) = values.get_mut(&label.value) {
                ids.remove(id);
                if ids.is_empty() {
                    values.remove(&label.value);
                }
            }
            if values.is_empty() {
                self.by_label.remove(&label.name);
            }
        }
        self.all.remove(id);
    }

    pub fn len(&self) -> u64 {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Ids matching every matcher.
    ///
    /// Each matcher yields a candidate set; sets are intersected smallest
    /// first and the walk stops as soon as the intersection is empty.
    pub fn select(&self, matchers: &[Matcher]) -> RoaringBitmap {
        if matchers.is_empty() {
            return self.all.clone();
        }

        let mut candidates: Vec<RoaringBitmap> = Vec::with_capacity(matchers.len());
        for matcher in matchers {
            let set = self.candidates(matcher);
            if set.is_empty() {
                return RoaringBitmap::new();
            }
            candidates.push(set);
        }
        candidates.sort_by_key(|s| s.len());

        let mut iter = candidates.into_iter();
        let mut result = iter.next().unwrap_or_default();
        for set in iter {
            result &= set;
            if result.is_empty() {
                break;
            }
        }
        result
    }

    fn candidates(&self, matcher: &Matcher) -> RoaringBitmap {
        let values = self.by_label.get(&matcher.name);

        if matcher.matches_empty() {
            // series without the label match too: take everything except
            // series carrying a value the matcher rejects
            let mut excluded = RoaringBitmap::new();
            if let Some(values) = values {
                for (value, ids) in values {
                    if !matcher.matches(value) {
                        excluded |= ids;
                    }
                }
            }
            return &self.all - &excluded;
        }

        let Some(values) = values else {
            return RoaringBitmap::new();
        };
        if matcher.op == MatchOp::Equal {
            return values.get(&matcher.value).cloned().unwrap_or_default();
        }
        let mut set = RoaringBitmap::new();
        for (value, ids) in values {
            if matcher.matches(value) {
                set |= ids;
            }
        }
        set
    }

    pub fn label_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.by_label.keys().collect();
        names.into_iter().cloned().collect()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        let values: BTreeSet<&String> = self
            .by_label
            .get(name)
            .map(|v| v.keys().collect())
            .unwrap_or_default();
        values.into_iter().cloned().collect()
    }
}

struct IndexInner {
    refs: HashMap<Labels, SeriesRef>,
    series: HashMap<SeriesRef, Labels>,
    postings: Postings,
    next_ref: u64,
}

/// Concurrent label set -> series reference registry
pub struct SeriesIndex {
    inner: RwLock<IndexInner>,
}

impl SeriesIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                refs: HashMap::new(),
                series: HashMap::new(),
                postings: Postings::new(),
                next_ref: 0,
            }),
        }
    }

    /// Resolve a label set, registering it on first sight.
    ///
    /// Returns the reference and whether this call created it. When two
    /// callers race on the same new label set, the first to take the write
    /// lock creates it and the other observes that reference.
    pub fn get_or_create(&self, labels: &Labels) -> Result<(SeriesRef, bool)> {
        if let Some(r) = self.inner.read().refs.get(labels) {
            return Ok((*r, false));
        }
        labels.validate()?;

        let mut inner = self.inner.write();
        if let Some(r) = inner.refs.get(labels) {
            return Ok((*r, false));
        }
        let r = SeriesRef::try_from(inner.next_ref)
            .map_err(|_| Error::Internal("series reference space exhausted".into()))?;
        inner.next_ref += 1;
        inner.series.insert(r, labels.clone());
        inner.postings.add(r, labels);
        inner.refs.insert(labels.clone(), r);
        Ok((r, true))
    }

    pub fn get(&self, labels: &Labels) -> Option<SeriesRef> {
        self.inner.read().refs.get(labels).copied()
    }

    pub fn labels(&self, r: SeriesRef) -> Option<Labels> {
        self.inner.read().series.get(&r).cloned()
    }

    pub fn match_series(&self, matchers: &[Matcher]) -> RoaringBitmap {
        self.inner.read().postings.select(matchers)
    }

    /// Matching references with their label sets, under a single read lock
    pub fn select(&self, matchers: &[Matcher]) -> Vec<(SeriesRef, Labels)> {
        let inner = self.inner.read();
        inner
            .postings
            .select(matchers)
            .iter()
            .filter_map(|r| inner.series.get(&r).map(|l| (r, l.clone())))
            .collect()
    }

    /// Remove every series for which `keep` returns false.
    /// Returns how many were removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(SeriesRef) -> bool,
    {
        let mut inner = self.inner.write();
        let doomed: Vec<SeriesRef> = inner.series.keys().copied().filter(|r| !keep(*r)).collect();
        for r in &doomed {
            if let Some(labels) = inner.series.remove(r) {
                inner.postings.remove(*r, &labels);
                inner.refs.remove(&labels);
            }
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label_names(&self) -> Vec<String> {
        self.inner.read().postings.label_names()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.inner.read().postings.label_values(name)
    }
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn l(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let index = SeriesIndex::new();
        let a = l(&[("__name__", "up"), ("job", "x")]);
        let (r1, created1) = index.get_or_create(&a).unwrap();
        let (r2, created2) = index.get_or_create(&a).unwrap();
        assert_eq!(r1, r2);
        assert!(created1);
        assert!(!created2);
        assert_eq!(index.labels(r1), Some(a));
    }

    #[test]
    fn test_concurrent_creation_agrees() {
        let index = Arc::new(SeriesIndex::new());
        let labels = l(&[("__name__", "requests"), ("path", "/")]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = index.clone();
                let labels = labels.clone();
                std::thread::spawn(move || index.get_or_create(&labels).unwrap())
            })
            .collect();
        let results: Vec<(SeriesRef, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|(r, _)| *r == results[0].0));
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_rejects_malformed() {
        let index = SeriesIndex::new();
        assert!(index.get_or_create(&l(&[("job", "x")])).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_match_series() {
        let index = SeriesIndex::new();
        let up_x1 = index.get_or_create(&l(&[("__name__", "up"), ("job", "x"), ("instance", "1")])).unwrap().0;
        let up_x2 = index.get_or_create(&l(&[("__name__", "up"), ("job", "x"), ("instance", "2")])).unwrap().0;
        let up_y1 = index.get_or_create(&l(&[("__name__", "up"), ("job", "y"), ("instance", "1")])).unwrap().0;
        let other = index.get_or_create(&l(&[("__name__", "other")])).unwrap().0;

        let m = |op, name: &str, value: &str| Matcher::new(op, name, value).unwrap();

        let got = index.match_series(&[m(MatchOp::Equal, "__name__", "up"), m(MatchOp::Equal, "job", "x")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![up_x1, up_x2]);

        let got = index.match_series(&[m(MatchOp::Equal, "__name__", "up"), m(MatchOp::NotEqual, "job", "x")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![up_y1]);

        let got = index.match_series(&[m(MatchOp::Regex, "instance", "1|2"), m(MatchOp::NotRegex, "job", "y")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![up_x1, up_x2]);

        // empty-matching matcher includes series without the label
        let got = index.match_series(&[m(MatchOp::NotEqual, "job", "x")]);
        assert_eq!(got.iter().collect::<Vec<_>>(), vec![up_y1, other]);

        let got = index.match_series(&[m(MatchOp::Equal, "job", "nope")]);
        assert!(got.is_empty());

        assert_eq!(index.label_values("job"), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(index.label_names(), vec!["__name__", "instance", "job"]);
    }

    #[test]
    fn test_retain_forgets_series() {
        let index = SeriesIndex::new();
        let a = l(&[("__name__", "up"), ("job", "x"), ("pod", "a")]);
        let b = l(&[("__name__", "up"), ("job", "x"), ("pod", "b")]);
        let gone = l(&[("__name__", "batch"), ("run", "7")]);
        let ra = index.get_or_create(&a).unwrap().0;
        let rb = index.get_or_create(&b).unwrap().0;
        let rg = index.get_or_create(&gone).unwrap().0;

        assert_eq!(index.retain(|r| r != rb && r != rg), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&b), None);
        assert_eq!(index.labels(rg), None);
        assert_eq!(index.label_values("pod"), vec!["a".to_string()]);
        assert_eq!(index.label_names(), vec!["__name__", "job", "pod"]);
        assert!(index.label_values("run").is_empty());
        let all = index.match_series(&[]);
        assert_eq!(all.iter().collect::<Vec<_>>(), vec![ra]);
        let not_x = index.match_series(&[Matcher::new(MatchOp::NotEqual, "job", "x").unwrap()]);
        assert!(not_x.is_empty());

        // a returning series gets a fresh reference
        let (again, created) = index.get_or_create(&b).unwrap();
        assert!(created);
        assert!(again > rg);
        assert_eq!(index.select(&[Matcher::equal("pod", "b")]), vec![(again, b)]);
    }
}
