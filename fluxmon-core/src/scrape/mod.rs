//! Scrape scheduler
//!
//! One task per target ticks on the target's own interval. Fetches share a
//! global semaphore so targets aligned on the same boundary cannot fan out
//! without bound; the target's timeout covers both the wait for a permit
//! and the fetch itself. Every tick appends the meta series `up`,
//! `scrape_duration_seconds` and `scrape_samples_scraped`, also when the
//! scrape failed.

pub mod exposition;
mod fetcher;

pub use fetcher::{Fetcher, HttpFetcher};

use crate::storage::Appender;
use crate::{now_millis, Error, Labels, Result, Timestamp};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler-wide settings
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Maximum number of fetches in flight across all targets
    pub concurrency: usize,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::config::SCRAPE_CONCURRENCY,
        }
    }
}

/// A single endpoint to scrape
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeTarget {
    pub job: String,
    pub url: String,
    /// Attached to every sample; always contains `job` and `instance`
    pub labels: Labels,
    pub interval: Duration,
    pub timeout: Duration,
    /// Exposed labels win over target labels when set
    pub honor_labels: bool,
    /// Scrapes exposing more samples fail; 0 disables the limit
    pub sample_limit: usize,
}

impl ScrapeTarget {
    /// Target for `url` with `job` / `instance` labels and default timing
    pub fn new(job: impl Into<String>, url: impl Into<String>) -> Self {
        let job = job.into();
        let url = url.into();
        let instance = instance_of(&url);
        Self {
            labels: Labels::from_pairs(&[("job", job.as_str()), ("instance", instance.as_str())]),
            job,
            url,
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            honor_labels: false,
            sample_limit: 0,
        }
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.job, self.url)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Config(format!("target {}: interval must be positive", self.url)));
        }
        if self.timeout.is_zero() || self.timeout >= self.interval {
            return Err(Error::Config(format!(
                "target {}: timeout must be positive and shorter than the interval",
                self.url
            )));
        }
        if self.labels.iter().any(|l| l.name.is_empty() || l.name == crate::METRIC_NAME_LABEL) {
            return Err(Error::Config(format!("target {}: invalid target labels {}", self.url, self.labels)));
        }
        Ok(())
    }

    /// Merge target labels into an exposed label set.
    ///
    /// Without `honor_labels` a conflicting exposed label is kept as
    /// `exported_<name>`.
    pub fn apply_labels(&self, exposed: &Labels) -> Labels {
        let mut builder = exposed.builder();
        for label in self.labels.iter() {
            match exposed.get(&label.name) {
                Some(_) if self.honor_labels => {}
                Some(value) => {
                    builder.set(&format!("exported_{}", label.name), value);
                    builder.set(&label.name, &label.value);
                }
                None => {
                    builder.set(&label.name, &label.value);
                }
            }
        }
        builder.build()
    }
}

/// `host:port` part of a URL
fn instance_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or(rest).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    Unknown,
    Up,
    Down,
}

/// Last observed state of a target
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub job: String,
    pub url: String,
    pub labels: Labels,
    pub health: TargetHealth,
    pub last_scrape: Option<Timestamp>,
    pub last_scrape_duration_secs: f64,
    pub last_samples: usize,
    pub last_error: Option<String>,
    pub interval_secs: f64,
}

impl TargetStatus {
    fn new(target: &ScrapeTarget) -> Self {
        Self {
            job: target.job.clone(),
            url: target.url.clone(),
            labels: target.labels.clone(),
            health: TargetHealth::Unknown,
            last_scrape: None,
            last_scrape_duration_secs: 0.0,
            last_samples: 0,
            last_error: None,
            interval_secs: target.interval.as_secs_f64(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScrapeMetrics {
    pub scrapes: AtomicU64,
    pub failures: AtomicU64,
    pub samples: AtomicU64,
}

struct Shared {
    appender: Arc<dyn Appender>,
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    metrics: ScrapeMetrics,
}

struct ScrapeLoop {
    target: ScrapeTarget,
    status: Arc<RwLock<TargetStatus>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the scrape loops for the current target set
pub struct ScrapeManager {
    shared: Arc<Shared>,
    loops: Mutex<HashMap<String, ScrapeLoop>>,
}

impl ScrapeManager {
    pub fn new(appender: Arc<dyn Appender>, fetcher: Arc<dyn Fetcher>, config: ScrapeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                appender,
                fetcher,
                permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
                metrics: ScrapeMetrics::default(),
            }),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the target set.
    ///
    /// Unchanged targets keep running; changed and removed targets are
    /// stopped. Must be called from within a tokio runtime.
    pub fn apply(&self, targets: Vec<ScrapeTarget>) -> Result<()> {
        for target in &targets {
            target.validate()?;
        }

        let mut loops = self.loops.lock();
        let mut next: HashMap<String, ScrapeLoop> = HashMap::with_capacity(targets.len());
        let (mut started, mut kept) = (0, 0);

        for target in targets {
            let id = target.id();
            if next.contains_key(&id) {
                warn!("Duplicate scrape target {}, ignoring", id);
                continue;
            }
            match loops.remove(&id) {
                Some(existing) if existing.target == target => {
                    kept += 1;
                    next.insert(id, existing);
                }
                previous => {
                    if let Some(previous) = previous {
                        previous.cancel.cancel();
                    }
                    started += 1;
                    next.insert(id, self.spawn(target));
                }
            }
        }

        let stopped = loops.len();
        for (_, old) in loops.drain() {
            old.cancel.cancel();
        }
        *loops = next;

        info!(
            "Applied scrape targets: {} started, {} unchanged, {} stopped",
            started, kept, stopped
        );
        Ok(())
    }

    fn spawn(&self, target: ScrapeTarget) -> ScrapeLoop {
        let status = Arc::new(RwLock::new(TargetStatus::new(&target)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            target.clone(),
            self.shared.clone(),
            status.clone(),
            cancel.clone(),
        ));
        ScrapeLoop {
            target,
            status,
            cancel,
            handle,
        }
    }

    /// Status of every active target, ordered by job and URL
    pub fn targets(&self) -> Vec<TargetStatus> {
        let mut out: Vec<TargetStatus> = self.loops.lock().values().map(|l| l.status.read().clone()).collect();
        out.sort_by(|a, b| (&a.job, &a.url).cmp(&(&b.job, &b.url)));
        out
    }

    pub fn metrics(&self) -> &ScrapeMetrics {
        &self.shared.metrics
    }

    /// Stop every loop and wait for them to exit
    pub async fn shutdown(&self) {
        let loops: Vec<ScrapeLoop> = self.loops.lock().drain().map(|(_, l)| l).collect();
        for l in &loops {
            l.cancel.cancel();
        }
        for l in loops {
            let _ = l.handle.await;
        }
        info!("Scrape manager stopped");
    }
}

impl Drop for ScrapeManager {
    fn drop(&mut self) {
        for l in self.loops.lock().values() {
            l.cancel.cancel();
        }
    }
}

async fn run_loop(
    target: ScrapeTarget,
    shared: Arc<Shared>,
    status: Arc<RwLock<TargetStatus>>,
    cancel: CancellationToken,
) {
    let interval_ms = target.interval.as_millis().max(1) as u64;
    let offset = Duration::from_millis(rand::thread_rng().gen_range(0..interval_ms));
    debug!(target = %target.url, "Starting scrape loop after {:?}", offset);

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(offset) => {}
    }

    let mut ticker = tokio::time::interval(target.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        scrape_once(&target, &shared, &status).await;
    }
    debug!(target = %target.url, "Scrape loop stopped");
}

async fn scrape_once(target: &ScrapeTarget, shared: &Shared, status: &RwLock<TargetStatus>) {
    let scrape_ts = now_millis();
    let started = Instant::now();

    let fetched = tokio::time::timeout(target.timeout, async {
        let _permit = shared
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Scrape("scrape pool closed".into()))?;
        shared.fetcher.fetch(target).await
    })
    .await
    .unwrap_or_else(|_| Err(Error::Scrape(format!("context deadline exceeded after {:?}", target.timeout))));

    let parsed = fetched.and_then(|body| exposition::parse(&body)).and_then(|samples| {
        if target.sample_limit > 0 && samples.len() > target.sample_limit {
            return Err(Error::Scrape(format!(
                "sample limit exceeded: {} > {}",
                samples.len(),
                target.sample_limit
            )));
        }
        Ok(samples)
    });
    let duration = started.elapsed();

    shared.metrics.scrapes.fetch_add(1, Ordering::Relaxed);
    let mut batch = Vec::new();
    let (up, scraped, error) = match parsed {
        Ok(samples) => {
            let n = samples.len();
            batch.reserve(n + 3);
            for s in samples {
                batch.push((target.apply_labels(&s.labels), s.timestamp.unwrap_or(scrape_ts), s.value));
            }
            (1.0, n, None)
        }
        Err(e) => {
            shared.metrics.failures.fetch_add(1, Ordering::Relaxed);
            warn!(target = %target.url, "Scrape failed: {}", e);
            (0.0, 0, Some(e.to_string()))
        }
    };

    for (name, value) in [
        ("up", up),
        ("scrape_duration_seconds", duration.as_secs_f64()),
        ("scrape_samples_scraped", scraped as f64),
    ] {
        let mut builder = target.labels.builder();
        builder.set(crate::METRIC_NAME_LABEL, name);
        batch.push((builder.build(), scrape_ts, value));
    }

    let appender = shared.appender.clone();
    match tokio::task::spawn_blocking(move || appender.append_batch(batch)).await {
        Ok(Ok(stats)) => {
            shared.metrics.samples.fetch_add(stats.appended as u64, Ordering::Relaxed);
            if stats.rejected() > 0 {
                debug!(
                    target = %target.url,
                    "{} samples rejected, first: {:?}",
                    stats.rejected(),
                    stats.first_rejection.as_ref().map(|e| e.to_string())
                );
            }
        }
        Ok(Err(e)) => warn!(target = %target.url, "Append failed: {}", e),
        Err(e) => warn!(target = %target.url, "Append task failed: {}", e),
    }

    let mut st = status.write();
    st.health = if error.is_none() { TargetHealth::Up } else { TargetHealth::Down };
    st.last_scrape = Some(scrape_ts);
    st.last_scrape_duration_secs = duration.as_secs_f64();
    st.last_samples = scraped;
    st.last_error = error;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AppendStats;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<(Labels, Timestamp, f64)>>,
    }

    impl Recorder {
        fn named(&self, name: &str, instance: &str) -> Vec<f64> {
            self.samples
                .lock()
                .iter()
                .filter(|(l, _, _)| l.metric_name() == Some(name) && l.get("instance") == Some(instance))
                .map(|(_, _, v)| *v)
                .collect()
        }
    }

    impl Appender for Recorder {
        fn append_batch(&self, samples: Vec<(Labels, Timestamp, f64)>) -> Result<AppendStats> {
            let mut stats = AppendStats::default();
            stats.appended = samples.len();
            self.samples.lock().extend(samples);
            Ok(stats)
        }
    }

    /// `slow:*` targets never answer, everything else returns one sample
    struct FakeFetcher;

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, target: &ScrapeTarget) -> Result<String> {
            if target.url.contains("slow") {
                std::future::pending::<()>().await;
            }
            if target.url.contains("broken") {
                return Ok("not a valid line {".into());
            }
            Ok("# TYPE requests_total counter\nrequests_total{path=\"/\"} 7\n".into())
        }
    }

    fn target(url: &str) -> ScrapeTarget {
        ScrapeTarget {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            ..ScrapeTarget::new("test", url)
        }
    }

    #[test]
    fn test_instance_label() {
        let t = ScrapeTarget::new("node", "http://host-1:9100/metrics");
        assert_eq!(t.labels.get("instance"), Some("host-1:9100"));
        assert_eq!(t.labels.get("job"), Some("node"));
    }

    #[test]
    fn test_label_precedence() {
        let exposed = Labels::from_pairs(&[("__name__", "m"), ("job", "inner"), ("path", "/")]);

        let t = ScrapeTarget::new("outer", "http://h:1/metrics");
        let merged = t.apply_labels(&exposed);
        assert_eq!(merged.get("job"), Some("outer"));
        assert_eq!(merged.get("exported_job"), Some("inner"));
        assert_eq!(merged.get("instance"), Some("h:1"));

        let honored = ScrapeTarget {
            honor_labels: true,
            ..t
        };
        let merged = honored.apply_labels(&exposed);
        assert_eq!(merged.get("job"), Some("inner"));
        assert_eq!(merged.get("exported_job"), None);
    }

    #[test]
    fn test_validate_timeout() {
        let t = ScrapeTarget {
            timeout: Duration::from_secs(15),
            ..ScrapeTarget::new("j", "http://h:1/metrics")
        };
        assert!(t.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_target_reports_down_without_affecting_others() {
        let recorder = Arc::new(Recorder::default());
        let manager = ScrapeManager::new(recorder.clone(), Arc::new(FakeFetcher), ScrapeConfig::default());
        manager
            .apply(vec![target("http://slow:1/metrics"), target("http://fast:1/metrics")])
            .unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;

        let slow_up = recorder.named("up", "slow:1");
        assert!(slow_up.len() >= 3, "got {:?}", slow_up);
        assert!(slow_up.iter().all(|v| *v == 0.0));
        assert!(recorder.named("requests_total", "slow:1").is_empty());

        let fast_up = recorder.named("up", "fast:1");
        assert!(fast_up.len() >= 3);
        assert!(fast_up.iter().all(|v| *v == 1.0));
        assert_eq!(recorder.named("requests_total", "fast:1").len(), fast_up.len());

        let statuses = manager.targets();
        let slow = statuses.iter().find(|s| s.url.contains("slow")).unwrap();
        assert_eq!(slow.health, TargetHealth::Down);
        assert!(slow.last_error.as_deref().unwrap().contains("deadline"));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_marks_down() {
        let recorder = Arc::new(Recorder::default());
        let manager = ScrapeManager::new(recorder.clone(), Arc::new(FakeFetcher), ScrapeConfig::default());
        manager.apply(vec![target("http://broken:1/metrics")]).unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;

        let up = recorder.named("up", "broken:1");
        assert!(!up.is_empty());
        assert!(up.iter().all(|v| *v == 0.0));
        assert_eq!(recorder.named("scrape_samples_scraped", "broken:1")[0], 0.0);
        assert!(manager.metrics().failures.load(Ordering::Relaxed) >= 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_replaces_targets() {
        let recorder = Arc::new(Recorder::default());
        let manager = ScrapeManager::new(recorder.clone(), Arc::new(FakeFetcher), ScrapeConfig::default());
        manager
            .apply(vec![target("http://a:1/metrics"), target("http://b:1/metrics")])
            .unwrap();
        assert_eq!(manager.targets().len(), 2);

        manager.apply(vec![target("http://b:1/metrics")]).unwrap();
        let statuses = manager.targets();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].url, "http://b:1/metrics");

        manager.shutdown().await;
        assert!(manager.targets().is_empty());
    }
}
