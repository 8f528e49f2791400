//! TOML configuration file
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9090"
//!
//! [storage]
//! data_dir = "data"
//! retention_secs = 1296000
//!
//! [[scrape_configs]]
//! job_name = "node"
//! targets = ["localhost:9100"]
//! interval_secs = 15
//!
//! [[rule_groups]]
//! name = "node"
//! [[rule_groups.rules]]
//! alert = "InstanceDown"
//! expr = "up == 0"
//! for_secs = 300
//! labels = { severity = "page" }
//! annotations = { summary = "{{ $labels.instance }} is down" }
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::compression::CompressionConfig;
use crate::notify::{DispatcherConfig, LogNotifier, Notifier, Route, WebhookNotifier};
use crate::query::QueryOptions;
use crate::rules::{AlertingRule, RecordingRule, Rule, RuleGroup, Slo};
use crate::scrape::{ScrapeConfig, ScrapeTarget};
use crate::storage::StorageConfig;
use crate::wal::{SyncPolicy, WalConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeJobSettings>,
    #[serde(default)]
    pub rule_groups: Vec<RuleGroupSettings>,
    #[serde(default)]
    pub slos: Vec<SloSettings>,
    #[serde(default)]
    pub alerting: AlertingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_scrape_concurrency")]
    pub scrape_concurrency: usize,
    /// How often cutover, compaction and retention run
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            scrape_concurrency: default_scrape_concurrency(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_block_range_secs")]
    pub block_range_secs: u64,
    #[serde(default = "default_cutover_grace_secs")]
    pub cutover_grace_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_compaction_levels")]
    pub compaction_levels: usize,
    #[serde(default = "default_compaction_factor")]
    pub compaction_factor: i64,
    /// 0 syncs after every write
    #[serde(default = "default_wal_sync_millis")]
    pub wal_sync_millis: u64,
    #[serde(default = "default_wal_segment_bytes")]
    pub wal_segment_bytes: usize,
    #[serde(default = "default_samples_per_chunk")]
    pub samples_per_chunk: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            block_range_secs: default_block_range_secs(),
            cutover_grace_secs: default_cutover_grace_secs(),
            retention_secs: default_retention_secs(),
            compaction_levels: default_compaction_levels(),
            compaction_factor: default_compaction_factor(),
            wal_sync_millis: default_wal_sync_millis(),
            wal_segment_bytes: default_wal_segment_bytes(),
            samples_per_chunk: default_samples_per_chunk(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySettings {
    #[serde(default = "default_lookback_delta_secs")]
    pub lookback_delta_secs: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            lookback_delta_secs: default_lookback_delta_secs(),
            timeout_secs: default_query_timeout_secs(),
            max_samples: default_max_samples(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeJobSettings {
    pub job_name: String,
    /// `host:port` addresses
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_scrape_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_scrape_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub honor_labels: bool,
    #[serde(default)]
    pub sample_limit: usize,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroupSettings {
    pub name: String,
    #[serde(default = "default_rule_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
}

/// Exactly one of `record` and `alert` must be set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    #[serde(default)]
    pub record: Option<String>,
    #[serde(default)]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(default)]
    pub for_secs: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SloSettings {
    pub name: String,
    /// Error ratio expression containing `$window`
    pub error_ratio: String,
    pub objective: f64,
    #[serde(default = "default_rule_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertingSettings {
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,
    #[serde(default = "default_group_wait_secs")]
    pub group_wait_secs: u64,
    #[serde(default = "default_group_interval_secs")]
    pub group_interval_secs: u64,
    #[serde(default = "default_repeat_interval_secs")]
    pub repeat_interval_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_backoff_millis")]
    pub retry_backoff_millis: u64,
    #[serde(default = "default_receiver")]
    pub default_receiver: String,
    #[serde(default)]
    pub receivers: Vec<ReceiverSettings>,
    #[serde(default)]
    pub routes: Vec<RouteSettings>,
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            group_by: default_group_by(),
            group_wait_secs: default_group_wait_secs(),
            group_interval_secs: default_group_interval_secs(),
            repeat_interval_secs: default_repeat_interval_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_millis: default_retry_backoff_millis(),
            default_receiver: default_receiver(),
            receivers: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// A receiver without `webhook_url` writes to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverSettings {
    pub name: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSettings {
    pub receiver: String,
    #[serde(default)]
    pub matchers: BTreeMap<String, String>,
    #[serde(default)]
    pub group_by: Option<Vec<String>>,
}

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_scrape_concurrency() -> usize {
    crate::config::SCRAPE_CONCURRENCY
}
fn default_maintenance_interval_secs() -> u64 {
    60
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_block_range_secs() -> u64 {
    (crate::config::BLOCK_RANGE_MS / 1000) as u64
}
fn default_cutover_grace_secs() -> u64 {
    default_block_range_secs() / 2
}
fn default_retention_secs() -> u64 {
    (crate::config::RETENTION_MS / 1000) as u64
}
fn default_compaction_levels() -> usize {
    crate::config::COMPACTION_LEVELS
}
fn default_compaction_factor() -> i64 {
    crate::config::COMPACTION_FACTOR
}
fn default_wal_sync_millis() -> u64 {
    crate::config::WAL_SYNC_MILLIS
}
fn default_wal_segment_bytes() -> usize {
    crate::config::WAL_SEGMENT_SIZE
}
fn default_samples_per_chunk() -> usize {
    crate::config::SAMPLES_PER_CHUNK
}
fn default_lookback_delta_secs() -> u64 {
    (crate::config::LOOKBACK_DELTA_MS / 1000) as u64
}
fn default_query_timeout_secs() -> u64 {
    crate::config::QUERY_TIMEOUT_MS / 1000
}
fn default_max_samples() -> usize {
    crate::config::QUERY_MAX_SAMPLES
}
fn default_scheme() -> String {
    "http".to_string()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_scrape_interval_secs() -> u64 {
    15
}
fn default_scrape_timeout_secs() -> u64 {
    10
}
fn default_rule_interval_secs() -> u64 {
    60
}
fn default_group_by() -> Vec<String> {
    vec!["alertname".to_string()]
}
fn default_group_wait_secs() -> u64 {
    30
}
fn default_group_interval_secs() -> u64 {
    5 * 60
}
fn default_repeat_interval_secs() -> u64 {
    4 * 60 * 60
}
fn default_retry_attempts() -> usize {
    5
}
fn default_retry_backoff_millis() -> u64 {
    500
}
fn default_receiver() -> String {
    "log".to_string()
}
fn default_webhook_timeout_secs() -> u64 {
    10
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check everything that can be checked without starting anything
    pub fn validate(&self) -> Result<()> {
        self.storage_config(None).validate()?;
        if self.query.timeout_secs == 0 || self.query.max_samples == 0 {
            return Err(Error::Config("query timeout and max_samples must be positive".into()));
        }
        if self.server.maintenance_interval_secs == 0 {
            return Err(Error::Config("maintenance_interval_secs must be positive".into()));
        }
        self.scrape_targets()?;
        self.rule_groups()?;
        self.dispatcher_config()?;
        Ok(())
    }

    /// Storage configuration, optionally rooted elsewhere
    pub fn storage_config(&self, data_dir: Option<&Path>) -> StorageConfig {
        let s = &self.storage;
        let data_dir = data_dir.map_or_else(|| s.data_dir.clone(), Path::to_path_buf);
        let sync_policy = match s.wal_sync_millis {
            0 => SyncPolicy::Immediate,
            millis => SyncPolicy::Interval { millis },
        };
        StorageConfig {
            wal: WalConfig {
                dir: data_dir.join(crate::storage::WAL_DIR),
                sync_policy,
                segment_size: s.wal_segment_bytes,
            },
            compression: CompressionConfig {
                samples_per_chunk: s.samples_per_chunk,
                ..Default::default()
            },
            block_range: secs_to_ms(s.block_range_secs),
            cutover_grace: secs_to_ms(s.cutover_grace_secs),
            retention: secs_to_ms(s.retention_secs),
            compaction_levels: s.compaction_levels,
            compaction_factor: s.compaction_factor,
            data_dir,
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            lookback_delta: secs_to_ms(self.query.lookback_delta_secs),
            timeout: Duration::from_secs(self.query.timeout_secs),
            max_samples: self.query.max_samples,
        }
    }

    pub fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig {
            concurrency: self.server.scrape_concurrency,
        }
    }

    pub fn scrape_targets(&self) -> Result<Vec<ScrapeTarget>> {
        let mut jobs = HashSet::new();
        let mut targets = Vec::new();
        for job in &self.scrape_configs {
            if !jobs.insert(job.job_name.as_str()) {
                return Err(Error::Config(format!("duplicate scrape job {}", job.job_name)));
            }
            if job.scheme != "http" && job.scheme != "https" {
                return Err(Error::Config(format!("job {}: unsupported scheme {}", job.job_name, job.scheme)));
            }
            let path = if job.metrics_path.starts_with('/') {
                job.metrics_path.clone()
            } else {
                format!("/{}", job.metrics_path)
            };

            for address in &job.targets {
                let base = ScrapeTarget::new(&job.job_name, format!("{}://{}{}", job.scheme, address, path));
                let mut labels = base.labels.builder();
                for (name, value) in &job.labels {
                    labels.set(name, value);
                }
                let target = ScrapeTarget {
                    labels: labels.build(),
                    interval: Duration::from_secs(job.interval_secs),
                    timeout: Duration::from_secs(job.timeout_secs),
                    honor_labels: job.honor_labels,
                    sample_limit: job.sample_limit,
                    ..base
                };
                target.validate()?;
                targets.push(target);
            }
        }
        Ok(targets)
    }

    /// Configured groups followed by one group per SLO
    pub fn rule_groups(&self) -> Result<Vec<RuleGroup>> {
        let mut groups = Vec::with_capacity(self.rule_groups.len() + self.slos.len());
        for g in &self.rule_groups {
            let rules = g
                .rules
                .iter()
                .map(|r| build_rule(&g.name, r))
                .collect::<Result<Vec<_>>>()?;
            groups.push(RuleGroup::new(&g.name, Duration::from_secs(g.interval_secs), rules)?);
        }
        for s in &self.slos {
            let slo = Slo {
                name: s.name.clone(),
                error_ratio: s.error_ratio.clone(),
                objective: s.objective,
                labels: s.labels.clone(),
            };
            let rules = slo.alerting_rules()?.into_iter().map(Rule::Alerting).collect();
            groups.push(RuleGroup::new(
                format!("slo:{}", s.name),
                Duration::from_secs(s.interval_secs),
                rules,
            )?);
        }

        let mut names = HashSet::new();
        for g in &groups {
            if !names.insert(g.name()) {
                return Err(Error::Config(format!("duplicate rule group {}", g.name())));
            }
        }
        Ok(groups)
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        let a = &self.alerting;
        let receivers = self.receiver_names();
        for receiver in std::iter::once(&a.default_receiver).chain(a.routes.iter().map(|r| &r.receiver)) {
            if !receivers.contains(receiver.as_str()) {
                return Err(Error::Config(format!("unknown receiver {}", receiver)));
            }
        }
        if a.retry_attempts == 0 {
            return Err(Error::Config("retry_attempts must be at least 1".into()));
        }
        Ok(DispatcherConfig {
            routes: a
                .routes
                .iter()
                .map(|r| Route {
                    receiver: r.receiver.clone(),
                    matchers: r.matchers.clone(),
                    group_by: r.group_by.clone(),
                })
                .collect(),
            default_receiver: a.default_receiver.clone(),
            group_by: a.group_by.clone(),
            group_wait: Duration::from_secs(a.group_wait_secs),
            group_interval: Duration::from_secs(a.group_interval_secs),
            repeat_interval: Duration::from_secs(a.repeat_interval_secs),
            retry_attempts: a.retry_attempts,
            retry_backoff: Duration::from_millis(a.retry_backoff_millis),
            ..Default::default()
        })
    }

    /// Configured receivers plus the built-in `log` receiver
    pub fn notifiers(&self) -> Result<Vec<Arc<dyn Notifier>>> {
        let mut out: Vec<Arc<dyn Notifier>> = Vec::new();
        let mut has_log = false;
        for r in &self.alerting.receivers {
            has_log |= r.name == "log";
            match &r.webhook_url {
                Some(url) => out.push(Arc::new(WebhookNotifier::new(
                    &r.name,
                    url,
                    Duration::from_secs(r.timeout_secs),
                )?)),
                None => out.push(Arc::new(LogNotifier::new(&r.name))),
            }
        }
        if !has_log {
            out.push(Arc::new(LogNotifier::new("log")));
        }
        Ok(out)
    }

    fn receiver_names(&self) -> HashSet<&str> {
        let mut names: HashSet<&str> = self.alerting.receivers.iter().map(|r| r.name.as_str()).collect();
        names.insert("log");
        names
    }
}

fn build_rule(group: &str, r: &RuleSettings) -> Result<Rule> {
    match (&r.record, &r.alert) {
        (Some(record), None) => {
            if !r.annotations.is_empty() || r.for_secs != 0 {
                return Err(Error::Config(format!(
                    "group {}: recording rule {} cannot have annotations or a for duration",
                    group, record
                )));
            }
            Ok(Rule::Recording(RecordingRule::new(record, &r.expr, r.labels.clone())?))
        }
        (None, Some(alert)) => Ok(Rule::Alerting(AlertingRule::new(
            alert,
            &r.expr,
            secs_to_ms(r.for_secs),
            r.labels.clone(),
            r.annotations.clone(),
        )?)),
        _ => Err(Error::Config(format!(
            "group {}: each rule needs exactly one of record and alert",
            group
        ))),
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    (secs as i64).saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[server]
listen = "127.0.0.1:9999"

[storage]
data_dir = "/var/lib/fluxmon"
retention_secs = 86400
wal_sync_millis = 0

[query]
lookback_delta_secs = 60

[[scrape_configs]]
job_name = "node"
targets = ["host-1:9100", "host-2:9100"]
interval_secs = 30
timeout_secs = 5
labels = { env = "prod" }

[[rule_groups]]
name = "node"
interval_secs = 30

[[rule_groups.rules]]
record = "job:up:sum"
expr = "sum by (job) (up)"

[[rule_groups.rules]]
alert = "InstanceDown"
expr = "up == 0"
for_secs = 300
labels = { severity = "page" }
annotations = { summary = "{{ $labels.instance }} is down" }

[[slos]]
name = "Api"
error_ratio = "sum(rate(errors_total[$window])) / sum(rate(requests_total[$window]))"
objective = 0.999

[alerting]
default_receiver = "ops"

[[alerting.receivers]]
name = "ops"
webhook_url = "http://alerts.internal/hook"

[[alerting.routes]]
receiver = "log"
matchers = { severity = "ticket" }
"#;

    #[test]
    fn test_empty_file_is_valid() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.listen, "0.0.0.0:9090");
        assert_eq!(settings.storage.block_range_secs, 7200);
        assert_eq!(settings.alerting.group_wait_secs, 30);
        assert_eq!(settings.query_options().lookback_delta, 300_000);
    }

    #[test]
    fn test_full_file() {
        let settings = Settings::from_toml_str(FULL).unwrap();

        let storage = settings.storage_config(None);
        assert_eq!(storage.data_dir, PathBuf::from("/var/lib/fluxmon"));
        assert_eq!(storage.wal.dir, PathBuf::from("/var/lib/fluxmon/wal"));
        assert_eq!(storage.wal.sync_policy, SyncPolicy::Immediate);
        assert_eq!(storage.retention, 86_400_000);
        let moved = settings.storage_config(Some(Path::new("/tmp/x")));
        assert_eq!(moved.wal.dir, PathBuf::from("/tmp/x/wal"));

        let targets = settings.scrape_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].url, "http://host-1:9100/metrics");
        assert_eq!(targets[0].labels.get("instance"), Some("host-1:9100"));
        assert_eq!(targets[0].labels.get("env"), Some("prod"));
        assert_eq!(targets[0].interval, Duration::from_secs(30));

        let groups = settings.rule_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rules().len(), 2);
        assert_eq!(groups[1].name(), "slo:Api");
        assert_eq!(groups[1].rules().len(), 3);

        let dispatcher = settings.dispatcher_config().unwrap();
        assert_eq!(dispatcher.default_receiver, "ops");
        assert_eq!(dispatcher.routes[0].receiver, "log");

        let notifiers = settings.notifiers().unwrap();
        let names: Vec<&str> = notifiers.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["ops", "log"]);
    }

    #[test]
    fn test_slo_group_name_clash() {
        let content = r#"
[[rule_groups]]
name = "slo:Api"

[[slos]]
name = "Api"
error_ratio = "sum(rate(errors_total[$window]))"
objective = 0.99
"#;
        let err = Settings::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("duplicate rule group slo:Api"), "{}", err);
    }

    #[test]
    fn test_invalid_files() {
        let cases = [
            "[server]\nunknown = 1\n",
            "bogus = true\n",
            "[[scrape_configs]]\njob_name = \"a\"\ntargets = [\"h:1\"]\ninterval_secs = 5\ntimeout_secs = 10\n",
            "[[scrape_configs]]\njob_name = \"a\"\n[[scrape_configs]]\njob_name = \"a\"\n",
            "[[rule_groups]]\nname = \"g\"\n[[rule_groups.rules]]\nexpr = \"up\"\n",
            "[[rule_groups]]\nname = \"g\"\n[[rule_groups.rules]]\nalert = \"A\"\nexpr = \"up ==\"\n",
            "[alerting]\ndefault_receiver = \"missing\"\n",
            "[storage]\ncutover_grace_secs = 99999\n",
            "[[rule_groups]]\nname = \"g\"\n[[rule_groups]]\nname = \"g\"\n",
        ];
        for case in cases {
            assert!(Settings::from_toml_str(case).is_err(), "accepted: {}", case);
        }
    }
}
