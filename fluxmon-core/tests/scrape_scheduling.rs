//! Scrape loops against local HTTP endpoints writing into a real engine

use fluxmon_core::query::{QueryEngine, QueryOptions};
use fluxmon_core::scrape::{HttpFetcher, ScrapeConfig, ScrapeManager, ScrapeTarget, TargetHealth};
use fluxmon_core::storage::{Engine, StorageConfig};
use fluxmon_core::now_millis;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BODY: &str = "# HELP node_load1 1m load average.\n# TYPE node_load1 gauge\nnode_load1 0.25\nnode_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 1024.5\n";

/// Answers every request with `BODY`
async fn serve_metrics() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    BODY.len(),
                    BODY
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Accepts connections and never answers
async fn serve_nothing() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

fn target(job: &str, addr: SocketAddr) -> ScrapeTarget {
    let mut target = ScrapeTarget::new(job, format!("http://{}/metrics", addr));
    target.interval = Duration::from_millis(200);
    target.timeout = Duration::from_millis(100);
    target
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_healthy_and_hung_targets() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Engine::open(StorageConfig::with_data_dir(dir.path())).unwrap());
    let query = QueryEngine::new(storage.clone(), QueryOptions::default());

    let good = serve_metrics().await;
    let hung = serve_nothing().await;
    let manager = ScrapeManager::new(
        storage.clone(),
        Arc::new(HttpFetcher::new().unwrap()),
        ScrapeConfig::default(),
    );
    manager.apply(vec![target("node", good), target("hung", hung)]).unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let statuses = manager.targets();
    manager.shutdown().await;

    assert_eq!(statuses.len(), 2);
    let hung_status = statuses.iter().find(|s| s.job == "hung").unwrap();
    assert_eq!(hung_status.health, TargetHealth::Down);
    assert!(hung_status.last_error.is_some());
    let good_status = statuses.iter().find(|s| s.job == "node").unwrap();
    assert_eq!(good_status.health, TargetHealth::Up);
    assert_eq!(good_status.last_samples, 2);

    let now = now_millis();
    let instant = |expr: &str| query.instant_query(expr, now).unwrap().value.into_vector();

    let up = instant("up{job=\"node\"}");
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].v, 1.0);
    assert_eq!(up[0].labels.get("instance"), Some(good.to_string().as_str()));
    assert_eq!(instant("up{job=\"hung\"}")[0].v, 0.0);

    let scrapes = instant("count_over_time(up{job=\"hung\"}[10s])");
    assert!(scrapes[0].v >= 3.0, "only {} scrapes of the hung target", scrapes[0].v);

    let load = instant("node_load1");
    assert_eq!(load.len(), 1);
    assert_eq!(load[0].v, 0.25);
    assert_eq!(load[0].labels.get("job"), Some("node"));

    assert_eq!(instant("scrape_samples_scraped{job=\"node\"}")[0].v, 2.0);
    assert_eq!(instant("scrape_samples_scraped{job=\"hung\"}")[0].v, 0.0);
    assert!(manager.metrics().failures.load(std::sync::atomic::Ordering::Relaxed) >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_apply_replaces_targets() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Engine::open(StorageConfig::with_data_dir(dir.path())).unwrap());
    let good = serve_metrics().await;
    let manager = ScrapeManager::new(
        storage.clone(),
        Arc::new(HttpFetcher::new().unwrap()),
        ScrapeConfig::default(),
    );

    manager.apply(vec![target("a", good), target("b", good)]).unwrap();
    assert_eq!(manager.targets().len(), 2);

    manager.apply(vec![target("b", good)]).unwrap();
    let targets = manager.targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].job, "b");

    // an invalid set leaves the running set alone
    let mut bad = target("c", good);
    bad.timeout = Duration::from_secs(1);
    assert!(manager.apply(vec![bad]).is_err());
    assert_eq!(manager.targets()[0].job, "b");

    manager.shutdown().await;
    assert!(manager.targets().is_empty());
}
