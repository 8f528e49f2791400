//! Rules over stored data feeding the alert dispatcher

use async_trait::async_trait;
use fluxmon_core::notify::{Dispatcher, DispatcherConfig, Notification, NotificationStatus, Notifier};
use fluxmon_core::query::{QueryEngine, QueryOptions};
use fluxmon_core::rules::{AlertState, AlertingRule, RecordingRule, Rule, RuleContext, RuleGroup};
use fluxmon_core::storage::{Engine, StorageConfig};
use fluxmon_core::{Labels, Result, Timestamp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MINUTE: Timestamp = 60_000;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, groups: &[Notification]) -> Result<()> {
        self.sent.lock().extend_from_slice(groups);
        Ok(())
    }

    fn name(&self) -> &str {
        "default"
    }
}

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn up(storage: &Engine, instance: &str, t: Timestamp, v: f64) {
    let labels = Labels::from_pairs(&[("__name__", "up"), ("job", "node"), ("instance", instance)]);
    storage.append(labels, t, v).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_instance_down_fires_and_resolves() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Engine::open(StorageConfig::with_data_dir(dir.path())).unwrap());
    let query = QueryEngine::new(storage.clone(), QueryOptions::default());

    let recorder = Arc::new(Recorder::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), vec![notifier]));
    let ctx = RuleContext {
        query: query.clone(),
        appender: storage.clone(),
        sink: Some(dispatcher.clone()),
    };

    let group = RuleGroup::new(
        "node",
        Duration::from_secs(60),
        vec![
            Rule::Recording(RecordingRule::new("job:up:sum", "sum by (job) (up)", BTreeMap::new()).unwrap()),
            Rule::Alerting(
                AlertingRule::new(
                    "InstanceDown",
                    "up == 0",
                    2 * MINUTE,
                    map(&[("severity", "page")]),
                    map(&[("summary", "{{ $labels.instance }} is down")]),
                )
                .unwrap(),
            ),
        ],
    )
    .unwrap();
    let Rule::Alerting(rule) = &group.rules()[1] else {
        panic!("expected an alerting rule");
    };

    for minute in 0..=2 {
        let t = minute * MINUTE;
        up(&storage, "a", t, 0.0);
        up(&storage, "b", t, 1.0);
        assert_eq!(group.evaluate(t, &ctx), 0);

        let alerts = rule.alerts();
        assert_eq!(alerts.len(), 1);
        let expected = if minute < 2 { AlertState::Pending } else { AlertState::Firing };
        assert_eq!(alerts[0].state, expected, "at minute {}", minute);
        assert_eq!(alerts[0].active_at, 0);
        assert_eq!(alerts[0].last_active_at, t);
    }

    let alert = &rule.alerts()[0];
    assert_eq!(alert.labels.get("alertname"), Some("InstanceDown"));
    assert_eq!(alert.labels.get("severity"), Some("page"));
    assert_eq!(alert.labels.get("instance"), Some("a"));
    assert_eq!(alert.fired_at, Some(2 * MINUTE));
    let json = serde_json::to_value(alert).unwrap();
    assert_eq!(json["active_at"], 0);
    assert_eq!(json["last_active_at"], 2 * MINUTE);

    let alerts_series = query
        .instant_query("ALERTS{alertname=\"InstanceDown\", alertstate=\"firing\"}", 2 * MINUTE)
        .unwrap()
        .value
        .into_vector();
    assert_eq!(alerts_series.len(), 1);
    assert_eq!(alerts_series[0].labels.get("instance"), Some("a"));

    let pending = query
        .instant_query("ALERTS{alertstate=\"pending\"}", MINUTE)
        .unwrap()
        .value
        .into_vector();
    assert_eq!(pending.len(), 1);

    let recorded = query.instant_query("job:up:sum", 2 * MINUTE).unwrap().value.into_vector();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].labels, Labels::from_pairs(&[("__name__", "job:up:sum"), ("job", "node")]));
    assert_eq!(recorded[0].v, 1.0);

    // group_wait holds back the first notification
    assert_eq!(dispatcher.flush().await, 0);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(dispatcher.flush().await, 1);
    {
        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, NotificationStatus::Firing);
        assert_eq!(sent[0].group_labels, Labels::from_pairs(&[("alertname", "InstanceDown")]));
        assert_eq!(sent[0].alerts.len(), 1);
        assert_eq!(sent[0].alerts[0].annotations["summary"], "a is down");
        assert_eq!(sent[0].alerts[0].starts_at, 2 * MINUTE);
    }

    // unchanged group is not re-sent before the repeat interval
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    assert_eq!(dispatcher.flush().await, 0);

    // recovery
    let t = 3 * MINUTE;
    up(&storage, "a", t, 1.0);
    up(&storage, "b", t, 1.0);
    assert_eq!(group.evaluate(t, &ctx), 0);
    assert!(rule.alerts().is_empty());

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    assert_eq!(dispatcher.flush().await, 1);
    {
        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].status, NotificationStatus::Resolved);
        assert_eq!(sent[1].alerts[0].ends_at, Some(t));
    }
    assert_eq!(dispatcher.group_count(), 0);
    assert_eq!(dispatcher.metrics().notifications_sent.load(std::sync::atomic::Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failing_rule_keeps_group_running() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Engine::open(StorageConfig::with_data_dir(dir.path())).unwrap());
    let query = QueryEngine::new(storage.clone(), QueryOptions::default());
    let ctx = RuleContext {
        query,
        appender: storage.clone(),
        sink: None,
    };
    up(&storage, "a", 0, 1.0);
    up(&storage, "b", 0, 1.0);

    let group = RuleGroup::new(
        "mixed",
        Duration::from_secs(60),
        vec![
            // both series collapse to the same alert labels
            Rule::Alerting(AlertingRule::new("Clash", "up", 0, map(&[("instance", "x")]), BTreeMap::new()).unwrap()),
            Rule::Recording(RecordingRule::new("up:count", "count(up)", BTreeMap::new()).unwrap()),
        ],
    )
    .unwrap();

    assert_eq!(group.evaluate(0, &ctx), 1);
    let status = group.status();
    assert!(status.rules[0].last_error.is_some());
    assert!(status.rules[1].last_error.is_none());

    let v = ctx.query.instant_query("up:count", 0).unwrap().value.into_vector();
    assert_eq!(v[0].v, 2.0);
}
