//! FluxMon CLI - offline tools for a data directory and configuration files
//!
//! `query` opens the storage engine itself (replaying the WAL), so it must
//! not be pointed at a directory a running server owns.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use fluxmon_core::block::{self, BlockMeta};
use fluxmon_core::query::{self, QueryEngine, Value};
use fluxmon_core::settings::Settings;
use fluxmon_core::storage::{self, Engine, StorageConfig};
use fluxmon_core::{now_millis, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fluxmon-cli")]
#[command(about = "FluxMon command line tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate an expression against a data directory
    Query {
        /// Data directory
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Evaluation time (unix seconds or RFC 3339); defaults to now
        #[arg(long)]
        time: Option<String>,

        /// Range start; together with --end and --step runs a range query
        #[arg(long, requires_all = ["end", "step"])]
        start: Option<String>,

        #[arg(long, requires = "start")]
        end: Option<String>,

        /// Range step, e.g. 15s
        #[arg(long, requires = "start")]
        step: Option<String>,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,

        expr: String,
    },

    /// List the persisted blocks of a data directory
    Blocks {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Validate a configuration file
    CheckConfig { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Query {
            data_dir,
            time,
            start,
            end,
            step,
            json,
            expr,
        } => {
            let range = match (start, end, step) {
                (Some(s), Some(e), Some(st)) => Some((parse_time(&s)?, parse_time(&e)?, query::parse_duration(&st)?)),
                _ => None,
            };
            let time = time.as_deref().map(parse_time).transpose()?;
            run_query(&data_dir, &expr, time, range, json)
        }
        Command::Blocks { data_dir } => list_blocks(&data_dir),
        Command::CheckConfig { path } => check_config(&path),
    }
}

fn parse_time(s: &str) -> anyhow::Result<Timestamp> {
    if let Ok(secs) = s.parse::<f64>() {
        return Ok((secs * 1000.0).round() as Timestamp);
    }
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("invalid time {:?}", s))?;
    Ok(dt.timestamp_millis())
}

fn format_time(t: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| t.to_string())
}

fn run_query(
    data_dir: &Path,
    expr: &str,
    time: Option<Timestamp>,
    range: Option<(Timestamp, Timestamp, Timestamp)>,
    json: bool,
) -> anyhow::Result<()> {
    let storage = Engine::open(StorageConfig::with_data_dir(data_dir))
        .with_context(|| format!("failed to open {}", data_dir.display()))?;
    let engine = QueryEngine::new(Arc::new(storage), Default::default());

    let result = match range {
        Some((start, end, step)) => engine.range_query(expr, start, end, step)?,
        None => engine.instant_query(expr, time.unwrap_or_else(now_millis))?,
    };
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&to_json(&result.value))?);
        return Ok(());
    }
    match &result.value {
        Value::Scalar { v, .. } => println!("{}", v),
        Value::String { v, .. } => println!("{}", v),
        Value::Vector(samples) => {
            for s in samples {
                println!("{} => {} @ {}", s.labels, s.v, format_time(s.t));
            }
        }
        Value::Matrix(series) => {
            for s in series {
                println!("{}", s.labels);
                for p in &s.samples {
                    println!("  {} {}", format_time(p.t), p.v);
                }
            }
        }
    }
    eprintln!("({:.3}ms)", result.execution_time_ms);
    engine.storage().close()?;
    Ok(())
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Scalar { t, v } => serde_json::json!({ "t": t, "v": v }),
        Value::String { t, v } => serde_json::json!({ "t": t, "v": v }),
        Value::Vector(samples) => serde_json::to_value(samples).unwrap_or_default(),
        Value::Matrix(series) => serde_json::to_value(series).unwrap_or_default(),
    }
}

fn list_blocks(data_dir: &Path) -> anyhow::Result<()> {
    let blocks_dir = data_dir.join(storage::BLOCKS_DIR);
    let mut metas: Vec<BlockMeta> = Vec::new();
    for dir in block::list_block_dirs(&blocks_dir)? {
        match BlockMeta::load(&dir) {
            Ok(meta) => metas.push(meta),
            Err(e) => eprintln!("skipping {}: {}", dir.display(), e),
        }
    }
    metas.sort_by_key(|m| m.min_time);

    println!(
        "{:<38} {:<25} {:<25} {:>6} {:>10} {:>12} {:>8}",
        "ID", "MIN TIME", "MAX TIME", "LEVEL", "SERIES", "SAMPLES", "CHUNKS"
    );
    for m in &metas {
        println!(
            "{:<38} {:<25} {:<25} {:>6} {:>10} {:>12} {:>8}",
            m.id,
            format_time(m.min_time),
            format_time(m.max_time),
            m.compaction.level,
            m.stats.num_series,
            m.stats.num_samples,
            m.stats.num_chunks
        );
    }
    println!("{} blocks", metas.len());
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let settings = Settings::load(path)?;
    let targets = settings.scrape_targets()?;
    let groups = settings.rule_groups()?;
    let rules: usize = groups.iter().map(|g| g.rules().len()).sum();

    println!("{} is valid", path.display());
    println!("  scrape jobs:  {} ({} targets)", settings.scrape_configs.len(), targets.len());
    println!("  rule groups:  {} ({} rules, {} generated from SLOs)", groups.len(), rules, settings.slos.len());
    println!("  receivers:    {}", settings.alerting.receivers.len());
    println!("  routes:       {}", settings.alerting.routes.len());
    Ok(())
}
