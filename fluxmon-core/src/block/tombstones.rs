//! Deletion markers
//!
//! A tombstone hides the samples of one series inside an inclusive time
//! interval. Blocks keep them in `tombstones.json` next to the index; the
//! head keeps them in memory and logs them to the WAL.

use crate::{Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Inclusive deleted time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub mint: Timestamp,
    pub maxt: Timestamp,
}

impl Interval {
    pub fn new(mint: Timestamp, maxt: Timestamp) -> Self {
        Self { mint, maxt }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.mint && t <= self.maxt
    }
}

/// True when any interval covers `t`
pub fn is_deleted(intervals: &[Interval], t: Timestamp) -> bool {
    intervals.iter().any(|iv| iv.contains(t))
}

/// Tombstones keyed by series id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tombstones {
    intervals: BTreeMap<u32, Vec<Interval>>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interval, merging it with any overlapping or adjacent one
    pub fn add(&mut self, id: u32, interval: Interval) {
        let list = self.intervals.entry(id).or_default();
        list.push(interval);
        list.sort_by_key(|iv| iv.mint);

        let mut merged: Vec<Interval> = Vec::with_capacity(list.len());
        for iv in list.drain(..) {
            match merged.last_mut() {
                Some(last) if iv.mint <= last.maxt.saturating_add(1) => {
                    last.maxt = last.maxt.max(iv.maxt);
                }
                _ => merged.push(iv),
            }
        }
        *list = merged;
    }

    pub fn get(&self, id: u32) -> &[Interval] {
        self.intervals.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_deleted(&self, id: u32, t: Timestamp) -> bool {
        is_deleted(self.get(id), t)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[Interval])> {
        self.intervals.iter().map(|(id, v)| (*id, v.as_slice()))
    }

    /// Load from a JSON file; a missing file means no tombstones
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            crate::Error::Corruption(format!("invalid tombstones file {:?}: {}", path, e))
        })
    }

    /// Write atomically through a temporary file
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::Error::Internal(e.to_string()))?;
        fs::write(&tmp, data)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
