//! Alert grouping, debouncing and delivery

use super::{NotificationStatus, NotifiedAlert, Notification, Notifier};
use crate::rules::{Alert, AlertSink};
use crate::{Labels, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sends alerts whose labels equal all `matchers` to `receiver`
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub receiver: String,
    pub matchers: BTreeMap<String, String>,
    /// Overrides the dispatcher-wide grouping when set
    pub group_by: Option<Vec<String>>,
}

impl Route {
    fn matches(&self, labels: &Labels) -> bool {
        self.matchers
            .iter()
            .all(|(name, value)| labels.get(name).unwrap_or_default() == value)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Checked in order; the first match wins
    pub routes: Vec<Route>,
    pub default_receiver: String,
    pub group_by: Vec<String>,
    /// Delay before the first notification of a new group
    pub group_wait: Duration,
    /// Minimum spacing between notifications of one group
    pub group_interval: Duration,
    /// Unchanged groups are re-sent after this long
    pub repeat_interval: Duration,
    pub retry_attempts: usize,
    /// First retry delay; doubles on every further attempt
    pub retry_backoff: Duration,
    /// How often due groups are checked
    pub tick: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            default_receiver: "default".into(),
            group_by: vec!["alertname".into()],
            group_wait: Duration::from_secs(30),
            group_interval: Duration::from_secs(5 * 60),
            repeat_interval: Duration::from_secs(4 * 60 * 60),
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(500),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
}

struct Member {
    alert: Alert,
    resolved_at: Option<Timestamp>,
}

struct Notified {
    at: Instant,
    firing: BTreeSet<Labels>,
}

struct AggrGroup {
    receiver: String,
    labels: Labels,
    members: HashMap<Labels, Member>,
    next_flush: Instant,
    notified: Option<Notified>,
}

#[derive(Default)]
struct State {
    /// Last reported firing set per rule
    sources: HashMap<String, Vec<Alert>>,
    groups: HashMap<String, AggrGroup>,
}

/// Groups firing alerts and delivers them to notifiers
pub struct Dispatcher {
    config: RwLock<DispatcherConfig>,
    notifiers: RwLock<HashMap<String, Arc<dyn Notifier>>>,
    state: Mutex<State>,
    metrics: DispatcherMetrics,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            config: RwLock::new(config),
            notifiers: RwLock::new(by_name(notifiers)),
            state: Mutex::new(State::default()),
            metrics: DispatcherMetrics::default(),
        }
    }

    /// Swap routing and notifiers; existing groups are kept
    pub fn reconfigure(&self, config: DispatcherConfig, notifiers: Vec<Arc<dyn Notifier>>) {
        *self.config.write() = config;
        *self.notifiers.write() = by_name(notifiers);
        info!("Dispatcher reconfigured");
    }

    pub fn metrics(&self) -> &DispatcherMetrics {
        &self.metrics
    }

    /// Number of groups currently tracked
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    fn route(&self, labels: &Labels) -> (String, Labels) {
        let config = self.config.read();
        let route = config.routes.iter().find(|r| r.matches(labels));
        let receiver = route.map_or(config.default_receiver.clone(), |r| r.receiver.clone());
        let group_by = route.and_then(|r| r.group_by.as_ref()).unwrap_or(&config.group_by);
        (receiver, labels.keep(group_by))
    }

    /// Replace the firing set reported by `source`
    pub fn observe(&self, source: &str, firing: Vec<Alert>, ts: Timestamp) {
        let now = Instant::now();
        let group_wait = self.config.read().group_wait;
        let mut state = self.state.lock();

        let current: HashSet<Labels> = firing.iter().map(|a| a.labels.clone()).collect();
        let previous = if firing.is_empty() {
            state.sources.remove(source)
        } else {
            state.sources.insert(source.to_string(), firing.clone())
        };

        for alert in firing {
            let (receiver, group_labels) = self.route(&alert.labels);
            let key = format!("{}:{}", receiver, group_labels);
            let group = state.groups.entry(key).or_insert_with(|| {
                debug!(receiver = %receiver, "New alert group {}", group_labels);
                AggrGroup {
                    receiver,
                    labels: group_labels,
                    members: HashMap::new(),
                    next_flush: now + group_wait,
                    notified: None,
                }
            });
            group.members.insert(
                alert.labels.clone(),
                Member {
                    alert,
                    resolved_at: None,
                },
            );
        }

        for gone in previous.unwrap_or_default() {
            if current.contains(&gone.labels) {
                continue;
            }
            let (receiver, group_labels) = self.route(&gone.labels);
            let key = format!("{}:{}", receiver, group_labels);
            if let Some(member) = state
                .groups
                .get_mut(&key)
                .and_then(|g| g.members.get_mut(&gone.labels))
            {
                member.resolved_at = Some(ts);
            }
        }
    }

    /// Send every group that is due; returns the number of notifications sent
    pub async fn flush(&self) -> usize {
        let now = Instant::now();
        let (group_interval, repeat_interval, attempts, backoff) = {
            let c = self.config.read();
            (c.group_interval, c.repeat_interval, c.retry_attempts, c.retry_backoff)
        };

        let mut due: Vec<(String, Notification, BTreeSet<Labels>)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut finished = Vec::new();
            for (key, group) in state.groups.iter_mut() {
                if now < group.next_flush {
                    continue;
                }
                group.next_flush = now + group_interval;

                let firing: BTreeSet<Labels> = group
                    .members
                    .iter()
                    .filter(|(_, m)| m.resolved_at.is_none())
                    .map(|(l, _)| l.clone())
                    .collect();

                if firing.is_empty() {
                    if group.notified.is_some() {
                        let alerts = sorted_members(&group.members, |m| {
                            NotifiedAlert::resolved(&m.alert, m.resolved_at.unwrap_or_default())
                        });
                        due.push((key.clone(), notification(key, group, NotificationStatus::Resolved, alerts), firing));
                    }
                    finished.push(key.clone());
                    continue;
                }

                group.members.retain(|_, m| m.resolved_at.is_none());
                let changed = group.notified.as_ref().map_or(true, |n| n.firing != firing);
                let repeat = group
                    .notified
                    .as_ref()
                    .map_or(false, |n| now.duration_since(n.at) >= repeat_interval);
                if changed || repeat {
                    let alerts = sorted_members(&group.members, |m| NotifiedAlert::firing(&m.alert));
                    due.push((key.clone(), notification(key, group, NotificationStatus::Firing, alerts), firing));
                }
            }
            for key in finished {
                state.groups.remove(&key);
            }
        }

        if due.is_empty() {
            return 0;
        }

        let mut by_receiver: BTreeMap<String, Vec<(String, Notification, BTreeSet<Labels>)>> = BTreeMap::new();
        for entry in due {
            by_receiver.entry(entry.1.receiver.clone()).or_default().push(entry);
        }

        let mut sent = 0;
        for (receiver, entries) in by_receiver {
            let count = entries.len() as u64;
            let notifier = self.notifiers.read().get(&receiver).cloned();
            let Some(notifier) = notifier else {
                warn!(receiver = %receiver, "No notifier configured, dropping {} notifications", count);
                self.metrics.notifications_failed.fetch_add(count, Ordering::Relaxed);
                continue;
            };

            let batch: Arc<Vec<Notification>> = Arc::new(entries.iter().map(|e| e.1.clone()).collect());
            match deliver(notifier, batch, attempts, backoff).await {
                Ok(()) => {
                    self.metrics.notifications_sent.fetch_add(count, Ordering::Relaxed);
                    sent += entries.len();
                    let mut state = self.state.lock();
                    for (key, _, firing) in entries {
                        if let Some(group) = state.groups.get_mut(&key) {
                            group.notified = Some(Notified { at: now, firing });
                        }
                    }
                }
                Err(e) => {
                    self.metrics.notifications_failed.fetch_add(count, Ordering::Relaxed);
                    error!(
                        receiver = %receiver,
                        "Dropping {} notifications after {} attempts: {}",
                        count, attempts, e
                    );
                }
            }
        }
        sent
    }

    /// Flush due groups every `tick` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.read().tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.flush().await;
        }
        debug!("Dispatcher stopped");
    }
}

impl AlertSink for Dispatcher {
    fn update(&self, source: &str, firing: Vec<Alert>, ts: Timestamp) {
        self.observe(source, firing, ts);
    }
}

fn by_name(notifiers: Vec<Arc<dyn Notifier>>) -> HashMap<String, Arc<dyn Notifier>> {
    notifiers.into_iter().map(|n| (n.name().to_string(), n)).collect()
}

fn sorted_members(members: &HashMap<Labels, Member>, f: impl Fn(&Member) -> NotifiedAlert) -> Vec<NotifiedAlert> {
    let mut alerts: Vec<NotifiedAlert> = members.values().map(f).collect();
    alerts.sort_by(|a, b| a.labels.cmp(&b.labels));
    alerts
}

fn notification(key: &str, group: &AggrGroup, status: NotificationStatus, alerts: Vec<NotifiedAlert>) -> Notification {
    Notification {
        receiver: group.receiver.clone(),
        group_key: key.to_string(),
        group_labels: group.labels.clone(),
        status,
        alerts,
    }
}

async fn deliver(
    notifier: Arc<dyn Notifier>,
    batch: Arc<Vec<Notification>>,
    attempts: usize,
    backoff: Duration,
) -> crate::Result<()> {
    // 2^n * factor: first delay equals `backoff`
    let factor = (backoff.as_millis() as u64 / 2).max(1);
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(Duration::from_secs(60))
        .take(attempts.saturating_sub(1));

    Retry::spawn(strategy, || {
        let notifier = notifier.clone();
        let batch = batch.clone();
        async move {
            notifier.notify(&batch).await.map_err(|e| {
                warn!(receiver = %notifier.name(), "Notification attempt failed: {}", e);
                e
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::AlertState;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        name: String,
        fail_first: usize,
        calls: AtomicUsize,
        received: Mutex<Vec<Notification>>,
    }

    impl Recorder {
        fn new(name: &str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_first,
                calls: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<Notification> {
            self.received.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, groups: &[Notification]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::Notify("connection refused".into()));
            }
            self.received.lock().extend_from_slice(groups);
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn alert(name: &str, instance: &str) -> Alert {
        Alert {
            labels: Labels::from_pairs(&[("alertname", name), ("instance", instance), ("severity", "page")]),
            annotations: BTreeMap::new(),
            state: AlertState::Firing,
            active_at: 0,
            last_active_at: 0,
            fired_at: Some(0),
            value: 1.0,
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>) -> Dispatcher {
        let notifier: Arc<dyn Notifier> = recorder.clone();
        Dispatcher::new(DispatcherConfig::default(), vec![notifier])
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_wait_batches_alerts() {
        let recorder = Recorder::new("default", 0);
        let d = dispatcher(&recorder);

        d.observe("g/0/Down", vec![alert("Down", "a")], 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        d.observe("g/1/Down", vec![alert("Down", "b")], 0);

        assert_eq!(d.flush().await, 0);
        tokio::time::advance(Duration::from_secs(26)).await;
        assert_eq!(d.flush().await, 1);

        let received = recorder.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].status, NotificationStatus::Firing);
        assert_eq!(received[0].group_labels, Labels::from_pairs(&[("alertname", "Down")]));
        assert_eq!(received[0].alerts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_interval_and_repeat() {
        let recorder = Recorder::new("default", 0);
        let d = dispatcher(&recorder);

        d.observe("r", vec![alert("Down", "a")], 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(d.flush().await, 1);

        // a change is held back until the group interval has passed
        d.observe("r", vec![alert("Down", "a"), alert("Down", "b")], 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(d.flush().await, 0);
        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(d.flush().await, 1);
        assert_eq!(recorder.received()[1].alerts.len(), 2);

        // unchanged groups are only repeated after the repeat interval
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(d.flush().await, 0);
        tokio::time::advance(Duration::from_secs(4 * 3600)).await;
        assert_eq!(d.flush().await, 1);
        assert_eq!(recorder.received().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_after_all_members_clear() {
        let recorder = Recorder::new("default", 0);
        let d = dispatcher(&recorder);

        d.observe("r", vec![alert("Down", "a"), alert("Down", "b")], 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        d.flush().await;

        d.observe("r", vec![alert("Down", "b")], 1_000);
        tokio::time::advance(Duration::from_secs(300)).await;
        d.flush().await;
        let last = recorder.received().pop().unwrap();
        assert_eq!(last.status, NotificationStatus::Firing);
        assert_eq!(last.alerts.len(), 1);

        d.observe("r", Vec::new(), 2_000);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(d.flush().await, 1);
        let last = recorder.received().pop().unwrap();
        assert_eq!(last.status, NotificationStatus::Resolved);
        assert_eq!(last.alerts[0].ends_at, Some(2_000));
        assert_eq!(d.group_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_within_group_wait_is_silent() {
        let recorder = Recorder::new("default", 0);
        let d = dispatcher(&recorder);
        d.observe("r", vec![alert("Down", "a")], 0);
        d.observe("r", Vec::new(), 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(d.flush().await, 0);
        assert!(recorder.received().is_empty());
        assert_eq!(d.group_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let recorder = Recorder::new("default", 2);
        let d = dispatcher(&recorder);
        d.observe("r", vec![alert("Down", "a")], 0);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(d.flush().await, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(d.metrics().notifications_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries() {
        let recorder = Recorder::new("default", usize::MAX);
        let d = dispatcher(&recorder);
        d.observe("r", vec![alert("Down", "a")], 0);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(d.flush().await, 0);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 5);
        assert_eq!(d.metrics().notifications_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes() {
        let pager = Recorder::new("pager", 0);
        let tickets = Recorder::new("tickets", 0);
        let config = DispatcherConfig {
            default_receiver: "pager".into(),
            routes: vec![Route {
                receiver: "tickets".into(),
                matchers: BTreeMap::from([("severity".to_string(), "ticket".to_string())]),
                group_by: Some(vec!["instance".into()]),
            }],
            ..Default::default()
        };
        let d = Dispatcher::new(config, vec![pager.clone() as Arc<dyn Notifier>, tickets.clone()]);

        let mut ticket = alert("DiskFilling", "db-1");
        ticket.labels = Labels::from_pairs(&[("alertname", "DiskFilling"), ("instance", "db-1"), ("severity", "ticket")]);
        d.observe("a", vec![alert("Down", "a")], 0);
        d.observe("b", vec![ticket], 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(d.flush().await, 2);

        assert_eq!(pager.received().len(), 1);
        let t = tickets.received();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].group_labels, Labels::from_pairs(&[("instance", "db-1")]));
    }
}
