//! Rule evaluation
//!
//! Rules are organized in groups. Each group runs on its own ticker and
//! evaluates its rules in order, so a recording rule's output is visible
//! to later rules of the same group. A failing rule is marked unhealthy
//! and the rest of the group still runs.

mod alerting;
mod burnrate;
mod recording;
pub mod template;

pub use alerting::{Alert, AlertState, AlertingRule, ALERTS_METRIC, ALERT_NAME_LABEL, ALERT_STATE_LABEL};
pub use burnrate::{format_duration, BurnWindow, Slo, BURN_WINDOWS, WINDOW_PLACEHOLDER};
pub use recording::RecordingRule;

use crate::query::QueryEngine;
use crate::storage::Appender;
use crate::{now_millis, Error, Result, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives the firing alerts of a rule after every evaluation
pub trait AlertSink: Send + Sync {
    /// `source` identifies the rule; `firing` replaces its previous set
    fn update(&self, source: &str, firing: Vec<Alert>, ts: Timestamp);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleHealth {
    #[default]
    Unknown,
    Ok,
    Err,
}

/// Outcome of the most recent evaluation
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleState {
    pub health: RuleHealth,
    pub last_error: Option<String>,
    pub last_evaluation: Option<Timestamp>,
    pub evaluation_time: Duration,
}

impl RuleState {
    fn record(&mut self, ts: Timestamp, took: Duration, result: &Result<()>) {
        self.last_evaluation = Some(ts);
        self.evaluation_time = took;
        match result {
            Ok(()) => {
                self.health = RuleHealth::Ok;
                self.last_error = None;
            }
            Err(e) => {
                self.health = RuleHealth::Err;
                self.last_error = Some(e.to_string());
            }
        }
    }
}

#[derive(Debug)]
pub enum Rule {
    Recording(RecordingRule),
    Alerting(AlertingRule),
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Rule::Recording(r) => r.name(),
            Rule::Alerting(r) => r.name(),
        }
    }

    fn state(&self) -> &Mutex<RuleState> {
        match self {
            Rule::Recording(r) => &r.state,
            Rule::Alerting(r) => &r.state,
        }
    }

    pub fn status(&self) -> RuleStatus {
        let state = self.state().lock().clone();
        let (kind, query, duration_secs, labels, annotations, alerts) = match self {
            Rule::Recording(r) => ("recording", r.expr(), 0.0, r.labels().clone(), Default::default(), Vec::new()),
            Rule::Alerting(r) => (
                "alerting",
                r.expr(),
                r.for_ms() as f64 / 1000.0,
                r.labels().clone(),
                r.annotations().clone(),
                r.alerts(),
            ),
        };
        RuleStatus {
            name: self.name().to_string(),
            kind,
            query: query.to_string(),
            duration_secs,
            labels,
            annotations,
            health: state.health,
            last_error: state.last_error,
            last_evaluation: state.last_evaluation,
            evaluation_time_secs: state.evaluation_time.as_secs_f64(),
            alerts,
        }
    }
}

/// Rule description for the rules API
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub query: String,
    /// `for` duration of alerting rules
    pub duration_secs: f64,
    pub labels: std::collections::BTreeMap<String, String>,
    pub annotations: std::collections::BTreeMap<String, String>,
    pub health: RuleHealth,
    pub last_error: Option<String>,
    pub last_evaluation: Option<Timestamp>,
    pub evaluation_time_secs: f64,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub interval_secs: f64,
    pub last_evaluation: Option<Timestamp>,
    pub evaluation_time_secs: f64,
    pub rules: Vec<RuleStatus>,
}

/// Collaborators a group evaluation needs
#[derive(Clone)]
pub struct RuleContext {
    pub query: QueryEngine,
    pub appender: Arc<dyn Appender>,
    pub sink: Option<Arc<dyn AlertSink>>,
}

#[derive(Debug, Default)]
pub struct RuleMetrics {
    pub evaluations: AtomicU64,
    pub evaluation_failures: AtomicU64,
    pub missed_iterations: AtomicU64,
}

/// Rules evaluated together on one interval
#[derive(Debug)]
pub struct RuleGroup {
    name: String,
    interval: Duration,
    rules: Vec<Rule>,
    last: Mutex<(Option<Timestamp>, Duration)>,
}

impl RuleGroup {
    pub fn new(name: impl Into<String>, interval: Duration, rules: Vec<Rule>) -> Result<Self> {
        let name = name.into();
        if interval.is_zero() {
            return Err(Error::Config(format!("rule group {}: interval must be positive", name)));
        }
        let mut seen = HashSet::new();
        for rule in &rules {
            if let Rule::Recording(r) = rule {
                if !seen.insert(r.name()) {
                    return Err(Error::Config(format!(
                        "rule group {}: duplicate recording rule {}",
                        name,
                        r.name()
                    )));
                }
            }
        }
        Ok(Self {
            name,
            interval,
            rules,
            last: Mutex::new((None, Duration::ZERO)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Alert source key; the position keeps same-named rules apart
    fn source(&self, pos: usize, rule: &Rule) -> String {
        format!("{}/{}/{}", self.name, pos, rule.name())
    }

    /// Evaluate every rule once at `ts`, returning the number that failed
    pub fn evaluate(&self, ts: Timestamp, ctx: &RuleContext) -> usize {
        let started = Instant::now();
        let mut failures = 0;

        for (pos, rule) in self.rules.iter().enumerate() {
            let rule_started = Instant::now();
            let result = match rule {
                Rule::Recording(r) => r.eval(&ctx.query, ts).and_then(|samples| write(ctx, samples)),
                Rule::Alerting(r) => {
                    let result = r.eval(&ctx.query, ts).and_then(|samples| write(ctx, samples));
                    // a failed evaluation keeps the previous instances
                    if let Some(sink) = &ctx.sink {
                        sink.update(&self.source(pos, rule), r.firing(), ts);
                    }
                    result
                }
            };
            if let Err(e) = &result {
                failures += 1;
                warn!(group = %self.name, rule = %rule.name(), "Rule evaluation failed: {}", e);
            }
            rule.state().lock().record(ts, rule_started.elapsed(), &result);
        }

        *self.last.lock() = (Some(ts), started.elapsed());
        failures
    }

    pub fn status(&self) -> GroupStatus {
        let (last_evaluation, took) = *self.last.lock();
        GroupStatus {
            name: self.name.clone(),
            interval_secs: self.interval.as_secs_f64(),
            last_evaluation,
            evaluation_time_secs: took.as_secs_f64(),
            rules: self.rules.iter().map(Rule::status).collect(),
        }
    }

    /// Carry over live alerts from an older version of this group
    fn restore_from(&self, previous: &RuleGroup) {
        let old: Vec<&AlertingRule> = previous
            .rules
            .iter()
            .filter_map(|r| match r {
                Rule::Alerting(a) => Some(a),
                _ => None,
            })
            .collect();
        for rule in &self.rules {
            if let Rule::Alerting(a) = rule {
                if let Some(prev) = old.iter().find(|p| p.same_definition(a)) {
                    a.restore_from(prev);
                }
            }
        }
    }

    fn alert_sources(&self) -> Vec<String> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Rule::Alerting(_)))
            .map(|(pos, r)| self.source(pos, r))
            .collect()
    }
}

fn write(ctx: &RuleContext, samples: Vec<(crate::Labels, Timestamp, f64)>) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let stats = ctx.appender.append_batch(samples)?;
    if stats.rejected() > 0 {
        debug!(
            "{} rule samples rejected, first: {:?}",
            stats.rejected(),
            stats.first_rejection.as_ref().map(|e| e.to_string())
        );
    }
    Ok(())
}

struct GroupLoop {
    group: Arc<RuleGroup>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the configured rule groups
pub struct RuleManager {
    ctx: RuleContext,
    metrics: Arc<RuleMetrics>,
    groups: Mutex<Vec<GroupLoop>>,
}

impl RuleManager {
    pub fn new(ctx: RuleContext) -> Self {
        Self {
            ctx,
            metrics: Arc::new(RuleMetrics::default()),
            groups: Mutex::new(Vec::new()),
        }
    }

    /// Replace all groups, keeping alert state of unchanged alerting rules.
    /// Must be called from within a tokio runtime.
    pub fn apply(&self, groups: Vec<RuleGroup>) -> Result<()> {
        let mut names = HashSet::new();
        for g in &groups {
            if !names.insert(g.name().to_string()) {
                return Err(Error::Config(format!("duplicate rule group {}", g.name())));
            }
        }

        let mut current = self.groups.lock();
        let mut old: HashMap<String, GroupLoop> = current
            .drain(..)
            .map(|l| (l.group.name().to_string(), l))
            .collect();

        let mut live_sources = HashSet::new();
        let mut retired = Vec::with_capacity(old.len());
        let mut next = Vec::with_capacity(groups.len());
        for group in groups {
            if let Some(prev) = old.remove(group.name()) {
                group.restore_from(&prev.group);
                retired.push(prev);
            }
            live_sources.extend(group.alert_sources());
            next.push(self.spawn(Arc::new(group)));
        }
        retired.extend(old.into_values());

        let ts = now_millis();
        for prev in &retired {
            prev.cancel.cancel();
            // alerts of removed rules resolve
            if let Some(sink) = &self.ctx.sink {
                for source in prev.group.alert_sources() {
                    if !live_sources.contains(&source) {
                        sink.update(&source, Vec::new(), ts);
                    }
                }
            }
        }

        info!("Loaded {} rule groups", next.len());
        *current = next;
        Ok(())
    }

    fn spawn(&self, group: Arc<RuleGroup>) -> GroupLoop {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_group(
            group.clone(),
            self.ctx.clone(),
            self.metrics.clone(),
            cancel.clone(),
        ));
        GroupLoop { group, cancel, handle }
    }

    pub fn groups(&self) -> Vec<GroupStatus> {
        self.groups.lock().iter().map(|l| l.group.status()).collect()
    }

    /// Pending and firing alerts across all rules
    pub fn alerts(&self) -> Vec<Alert> {
        let groups: Vec<Arc<RuleGroup>> = self.groups.lock().iter().map(|l| l.group.clone()).collect();
        groups
            .iter()
            .flat_map(|g| g.rules().iter())
            .filter_map(|r| match r {
                Rule::Alerting(a) => Some(a.alerts()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn metrics(&self) -> &RuleMetrics {
        &self.metrics
    }

    pub async fn shutdown(&self) {
        let loops: Vec<GroupLoop> = self.groups.lock().drain(..).collect();
        for l in &loops {
            l.cancel.cancel();
        }
        for l in loops {
            let _ = l.handle.await;
        }
        info!("Rule manager stopped");
    }
}

impl Drop for RuleManager {
    fn drop(&mut self) {
        for l in self.groups.lock().iter() {
            l.cancel.cancel();
        }
    }
}

async fn run_group(group: Arc<RuleGroup>, ctx: RuleContext, metrics: Arc<RuleMetrics>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(group.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(group = %group.name(), "Starting rule group every {:?}", group.interval());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let ts = now_millis();
        let (g, c) = (group.clone(), ctx.clone());
        let failures = match tokio::task::spawn_blocking(move || g.evaluate(ts, &c)).await {
            Ok(failures) => failures,
            Err(e) => {
                warn!(group = %group.name(), "Rule group evaluation task failed: {}", e);
                group.rules().len()
            }
        };
        metrics.evaluations.fetch_add(group.rules().len() as u64, Ordering::Relaxed);
        metrics.evaluation_failures.fetch_add(failures as u64, Ordering::Relaxed);

        let took = started.elapsed();
        if took > group.interval() {
            metrics.missed_iterations.fetch_add(1, Ordering::Relaxed);
            warn!(
                group = %group.name(),
                "Rule group evaluation behind schedule, took {:?} for an interval of {:?}",
                took,
                group.interval()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryOptions;
    use crate::storage::{Engine, StorageConfig};
    use crate::Labels;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        updates: Mutex<Vec<(String, usize)>>,
    }

    impl AlertSink for Collect {
        fn update(&self, source: &str, firing: Vec<Alert>, _ts: Timestamp) {
            self.updates.lock().push((source.to_string(), firing.len()));
        }
    }

    fn setup() -> (TempDir, Arc<Engine>, RuleContext, Arc<Collect>) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(StorageConfig::with_data_dir(dir.path())).unwrap());
        let sink = Arc::new(Collect::default());
        let ctx = RuleContext {
            query: QueryEngine::new(engine.clone(), QueryOptions::default()),
            appender: engine.clone(),
            sink: Some(sink.clone()),
        };
        (dir, engine, ctx, sink)
    }

    fn group(interval: Duration) -> RuleGroup {
        RuleGroup::new(
            "api",
            interval,
            vec![
                Rule::Recording(RecordingRule::new("job:up:sum", "sum by (job) (up)", BTreeMap::new()).unwrap()),
                Rule::Alerting(
                    AlertingRule::new("JobDown", "job:up:sum == 0", 0, BTreeMap::new(), BTreeMap::new()).unwrap(),
                ),
                Rule::Alerting(AlertingRule::new("Broken", "up / on(x) group_left up", 0, BTreeMap::new(), BTreeMap::new()).unwrap()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_group_chains_rules_and_isolates_failures() {
        let (_dir, engine, ctx, sink) = setup();
        let up = |i: &str| Labels::from_pairs(&[("__name__", "up"), ("job", "api"), ("instance", i)]);
        engine.append(up("1"), 1_000, 0.0).unwrap();
        engine.append(up("2"), 1_000, 0.0).unwrap();

        let g = group(Duration::from_secs(10));
        let failures = g.evaluate(2_000, &ctx);
        // group_left over duplicate right-hand series fails
        assert_eq!(failures, 1);

        let recorded = ctx.query.instant_query("job:up:sum", 2_000).unwrap().value.into_vector();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].v, 0.0);

        let alerts = ctx.query.instant_query("ALERTS", 2_000).unwrap().value.into_vector();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].labels.get("alertname"), Some("JobDown"));
        assert_eq!(alerts[0].labels.get("alertstate"), Some("firing"));

        let status = g.status();
        assert_eq!(status.rules[0].health, RuleHealth::Ok);
        assert_eq!(status.rules[1].health, RuleHealth::Ok);
        assert_eq!(status.rules[1].alerts.len(), 1);
        assert_eq!(status.rules[2].health, RuleHealth::Err);
        assert!(status.rules[2].last_error.is_some());
        assert_eq!(status.last_evaluation, Some(2_000));

        let updates = sink.updates.lock().clone();
        assert!(updates.contains(&("api/1/JobDown".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_apply_keeps_alert_state() {
        let (_dir, engine, ctx, _sink) = setup();
        engine
            .append(Labels::from_pairs(&[("__name__", "up"), ("job", "api")]), now_millis(), 0.0)
            .unwrap();

        let manager = RuleManager::new(ctx.clone());
        let g = group(Duration::from_secs(3600));
        g.evaluate(now_millis(), &ctx);
        let before = g.status().rules[1].alerts.clone();
        assert_eq!(before.len(), 1);

        // the first evaluation after apply happens immediately; state is
        // carried over so active_at does not move
        manager.apply(vec![g]).unwrap();
        manager.apply(vec![group(Duration::from_secs(3600))]).unwrap();
        let alerts = manager.alerts();
        assert!(!alerts.is_empty());
        assert!(alerts.iter().all(|a| a.active_at == before[0].active_at));

        assert!(manager.apply(vec![group(Duration::from_secs(1)), group(Duration::from_secs(1))]).is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_group_resolves_alerts() {
        let (_dir, _engine, ctx, sink) = setup();
        let manager = RuleManager::new(ctx);
        manager.apply(vec![group(Duration::from_secs(3600))]).unwrap();
        manager.apply(Vec::new()).unwrap();

        let updates = sink.updates.lock().clone();
        assert!(updates.contains(&("api/1/JobDown".to_string(), 0)));
        assert!(manager.groups().is_empty());
        manager.shutdown().await;
    }
}
