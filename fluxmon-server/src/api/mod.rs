//! HTTP API endpoints
//!
//! Responses use the Prometheus envelope:
//! `{"status": "success", "data": ...}` or
//! `{"status": "error", "errorType": ..., "error": ...}`.

use crate::app::App;
use crate::protocol::{
    format_time, format_value, parse_duration, parse_time, parse_timeout, ExpositionWriter, MetricKind,
};
use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use fluxmon_core::query::{self, QueryResult, Value};
use fluxmon_core::scrape::exposition;
use fluxmon_core::{label_names, now_millis, Error, Labels, Matcher, QueryError, Timestamp};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<App>;

/// Create the API router
pub fn create_router(app: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Query
        .route("/api/v1/query", get(instant_query).post(instant_query))
        .route("/api/v1/query_range", get(range_query).post(range_query))

        // Metadata
        .route("/api/v1/labels", get(labels).post(labels))
        .route("/api/v1/label/:name/values", get(label_values))
        .route("/api/v1/series", get(series).post(series))

        // Collection and alerting state
        .route("/api/v1/targets", get(targets))
        .route("/api/v1/alerts", get(alerts))
        .route("/api/v1/rules", get(rules))
        .route("/api/v1/status/tsdb", get(tsdb_status))

        // Writes and administration
        .route("/api/v1/import", post(import))
        .route("/api/v1/admin/tsdb/delete_series", post(delete_series))
        .route("/-/reload", post(reload))

        // Self-monitoring
        .route("/metrics", get(metrics))
        .route("/-/healthy", get(healthy))
        .route("/-/ready", get(healthy))

        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

// ============================================================================
// Envelope and errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

fn success<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        status: "success",
        data,
        warnings: Vec::new(),
    })
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_type: &'static str,
    message: String,
}

impl ApiError {
    fn bad_data(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: "bad_data",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "errorType": self.error_type,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::Parse { .. } | QueryError::BadData(_) => StatusCode::BAD_REQUEST,
            QueryError::Timeout(_) | QueryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::TooManySamples { .. } | QueryError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            error_type: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Query(q) => q.into(),
            Error::Config(_) | Error::InvalidLabels(_) | Error::Scrape(_) => ApiError::bad_data(err.to_string()),
            Error::Unavailable(_) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error_type: "unavailable",
                message: err.to_string(),
            },
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::internal(err.to_string())
    }
}

// ============================================================================
// Request parameters
// ============================================================================

/// URL query parameters merged with a form-encoded POST body.
/// Repeated keys such as `match[]` are kept in order.
struct Params(Vec<(String, String)>);

impl Params {
    async fn read(request: Request) -> Result<Self, ApiError> {
        let Query(mut pairs) = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
            .map_err(|e| ApiError::bad_data(format!("invalid query string: {}", e)))?;

        let is_form = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
        if request.method() == Method::POST && is_form {
            let Form(body) = Form::<Vec<(String, String)>>::from_request(request, &())
                .await
                .map_err(|e| ApiError::bad_data(format!("invalid form body: {}", e)))?;
            pairs.extend(body);
        }
        Ok(Self(pairs))
    }

    /// Last value given for `name`
    fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().rev().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.0.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    fn required(&self, name: &str) -> Result<&str, ApiError> {
        self.get(name)
            .ok_or_else(|| ApiError::bad_data(format!("missing parameter {:?}", name)))
    }

    fn time(&self, name: &str) -> Result<Option<Timestamp>, ApiError> {
        self.get(name).map(parse_time).transpose().map_err(ApiError::bad_data)
    }

    /// Optional `start`/`end` bounds, open-ended when absent
    fn time_range(&self) -> Result<(Timestamp, Timestamp), ApiError> {
        let start = self.time("start")?.unwrap_or(Timestamp::MIN);
        let end = self.time("end")?.unwrap_or(Timestamp::MAX);
        if end < start {
            return Err(ApiError::bad_data("end timestamp must not be before start time"));
        }
        Ok((start, end))
    }

    /// Parsed `match[]` selectors
    fn selectors(&self) -> Result<Vec<Vec<Matcher>>, ApiError> {
        self.all("match[]")
            .into_iter()
            .map(|s| query::parse_selector(s).map_err(ApiError::from))
            .collect()
    }
}

/// Union of the series selected by any of the selector sets
fn select_series(app: &App, selectors: &[Vec<Matcher>], start: Timestamp, end: Timestamp) -> BTreeSet<Labels> {
    let querier = app.storage.querier();
    selectors
        .iter()
        .flat_map(|matchers| querier.series(matchers, start, end))
        .collect()
}

// ============================================================================
// Query
// ============================================================================

fn encode_value(value: &Value) -> serde_json::Value {
    let point = |t: Timestamp, v: f64| json!([format_time(t), format_value(v)]);
    let result = match value {
        Value::Scalar { t, v } => point(*t, *v),
        Value::String { t, v } => json!([format_time(*t), v]),
        Value::Vector(samples) => samples
            .iter()
            .map(|s| json!({ "metric": s.labels, "value": point(s.t, s.v) }))
            .collect(),
        Value::Matrix(series) => series
            .iter()
            .map(|s| {
                let values: Vec<_> = s.samples.iter().map(|p| point(p.t, p.v)).collect();
                json!({ "metric": s.labels, "values": values })
            })
            .collect(),
    };
    json!({ "resultType": value.type_name(), "result": result })
}

fn query_response(result: QueryResult) -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse {
        status: "success",
        data: encode_value(&result.value),
        warnings: result.warnings,
    })
}

async fn instant_query(
    State(app): State<AppState>,
    request: Request,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let params = Params::read(request).await?;
    let expr = params.required("query")?.to_string();
    let t = params.time("time")?.unwrap_or_else(now_millis);
    let engine = match params.get("timeout") {
        Some(s) => app.query.with_timeout(parse_timeout(s).map_err(ApiError::bad_data)?),
        None => app.query.clone(),
    };

    let result = tokio::task::spawn_blocking(move || engine.instant_query(&expr, t)).await??;
    Ok(query_response(result))
}

async fn range_query(
    State(app): State<AppState>,
    request: Request,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let params = Params::read(request).await?;
    let expr = params.required("query")?.to_string();
    let start = parse_time(params.required("start")?).map_err(ApiError::bad_data)?;
    let end = parse_time(params.required("end")?).map_err(ApiError::bad_data)?;
    let step = parse_duration(params.required("step")?).map_err(ApiError::bad_data)?;
    let engine = match params.get("timeout") {
        Some(s) => app.query.with_timeout(parse_timeout(s).map_err(ApiError::bad_data)?),
        None => app.query.clone(),
    };

    let result = tokio::task::spawn_blocking(move || engine.range_query(&expr, start, end, step)).await??;
    Ok(query_response(result))
}

// ============================================================================
// Metadata
// ============================================================================

async fn labels(State(app): State<AppState>, request: Request) -> Result<Json<ApiResponse<Vec<String>>>, ApiError> {
    let params = Params::read(request).await?;
    let selectors = params.selectors()?;
    if selectors.is_empty() {
        return Ok(success(app.storage.querier().label_names()));
    }
    let (start, end) = params.time_range()?;
    let series = select_series(&app, &selectors, start, end);
    Ok(success(label_names(&series)))
}

async fn label_values(
    State(app): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Json<ApiResponse<Vec<String>>>, ApiError> {
    let params = Params::read(request).await?;
    let selectors = params.selectors()?;
    if selectors.is_empty() {
        return Ok(success(app.storage.querier().label_values(&name)));
    }
    let (start, end) = params.time_range()?;
    let values: BTreeSet<String> = select_series(&app, &selectors, start, end)
        .iter()
        .filter_map(|l| l.get(&name).map(String::from))
        .collect();
    Ok(success(values.into_iter().collect()))
}

async fn series(State(app): State<AppState>, request: Request) -> Result<Json<ApiResponse<Vec<Labels>>>, ApiError> {
    let params = Params::read(request).await?;
    let selectors = params.selectors()?;
    if selectors.is_empty() {
        return Err(ApiError::bad_data("no match[] parameter provided"));
    }
    let (start, end) = params.time_range()?;
    Ok(success(select_series(&app, &selectors, start, end).into_iter().collect()))
}

// ============================================================================
// Targets, alerts, rules
// ============================================================================

async fn targets(State(app): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    success(json!({ "activeTargets": app.scrape.targets() }))
}

async fn alerts(State(app): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    success(json!({ "alerts": app.rules.alerts() }))
}

async fn rules(State(app): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    success(json!({ "groups": app.rules.groups() }))
}

async fn tsdb_status(State(app): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    success(json!({
        "head": app.storage.stats(),
        "blocks": app.storage.blocks(),
    }))
}

// ============================================================================
// Writes and administration
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ImportResult {
    pub appended: usize,
    pub out_of_order: usize,
    pub out_of_bounds: usize,
    pub invalid: usize,
}

/// Append a text exposition body; samples without a timestamp get the
/// time of the request
async fn import(State(app): State<AppState>, body: String) -> Result<Json<ApiResponse<ImportResult>>, ApiError> {
    let exposed = exposition::parse(&body)?;
    let now = now_millis();
    let batch: Vec<(Labels, Timestamp, f64)> = exposed
        .into_iter()
        .map(|s| (s.labels, s.timestamp.unwrap_or(now), s.value))
        .collect();

    let storage = app.storage.clone();
    let stats = tokio::task::spawn_blocking(move || storage.append_batch(batch)).await??;
    Ok(success(ImportResult {
        appended: stats.appended,
        out_of_order: stats.out_of_order,
        out_of_bounds: stats.out_of_bounds,
        invalid: stats.invalid,
    }))
}

async fn delete_series(
    State(app): State<AppState>,
    request: Request,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let params = Params::read(request).await?;
    let selectors = params.selectors()?;
    if selectors.is_empty() {
        return Err(ApiError::bad_data("no match[] parameter provided"));
    }
    let (start, end) = params.time_range()?;

    let storage = app.storage.clone();
    let deleted = tokio::task::spawn_blocking(move || -> fluxmon_core::Result<usize> {
        let mut total = 0;
        for matchers in &selectors {
            total += storage.delete_series(matchers, start, end)?;
        }
        Ok(total)
    })
    .await??;
    Ok(success(json!({ "deletedSeries": deleted })))
}

async fn reload(State(app): State<AppState>) -> Result<Json<ApiResponse<()>>, ApiError> {
    app.reload().await?;
    Ok(success(()))
}

// ============================================================================
// Self-monitoring
// ============================================================================

async fn metrics(State(app): State<AppState>) -> impl IntoResponse {
    let stats = app.storage.stats();
    let m = &stats.metrics;
    let scrape = app.scrape.metrics();
    let rules = app.rules.metrics();
    let notify = app.dispatcher.metrics();
    let load = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed) as f64;

    let mut w = ExpositionWriter::new();
    w.metric("fluxmon_head_series", MetricKind::Gauge, "Series in the head block", stats.head_series as f64)
        .metric("fluxmon_head_samples", MetricKind::Gauge, "Samples in the head block", stats.head_samples as f64)
        .metric("fluxmon_blocks_loaded", MetricKind::Gauge, "Persisted blocks", stats.num_blocks as f64)
        .metric("fluxmon_blocks_bytes", MetricKind::Gauge, "Size of persisted blocks", stats.blocks_bytes as f64)
        .metric(
            "fluxmon_wal_healthy",
            MetricKind::Gauge,
            "Whether the WAL accepts writes",
            if stats.wal_healthy { 1.0 } else { 0.0 },
        )
        .metric("fluxmon_samples_appended_total", MetricKind::Counter, "Samples appended", m.samples_appended as f64)
        .metric("fluxmon_out_of_order_samples_total", MetricKind::Counter, "Out of order samples rejected", m.out_of_order as f64)
        .metric("fluxmon_out_of_bounds_samples_total", MetricKind::Counter, "Out of bounds samples rejected", m.out_of_bounds as f64)
        .metric("fluxmon_invalid_label_samples_total", MetricKind::Counter, "Samples rejected for invalid labels", m.invalid_labels as f64)
        .metric("fluxmon_wal_failures_total", MetricKind::Counter, "WAL write or fsync failures", m.wal_failures as f64)
        .metric("fluxmon_head_cutovers_total", MetricKind::Counter, "Head blocks cut over", m.cutovers as f64)
        .metric("fluxmon_compactions_total", MetricKind::Counter, "Compactions completed", m.compactions as f64)
        .metric("fluxmon_compaction_failures_total", MetricKind::Counter, "Compactions failed", m.compaction_failures as f64)
        .metric("fluxmon_blocks_deleted_total", MetricKind::Counter, "Blocks deleted by retention", m.blocks_deleted as f64)
        .metric("fluxmon_blocks_quarantined_total", MetricKind::Counter, "Corrupt blocks quarantined", m.blocks_quarantined as f64)
        .metric("fluxmon_series_removed_total", MetricKind::Counter, "Inactive series dropped from the index", m.series_removed as f64)
        .metric("fluxmon_scrapes_total", MetricKind::Counter, "Scrapes attempted", load(&scrape.scrapes))
        .metric("fluxmon_scrape_failures_total", MetricKind::Counter, "Scrapes failed", load(&scrape.failures))
        .metric("fluxmon_scraped_samples_total", MetricKind::Counter, "Samples scraped", load(&scrape.samples))
        .metric("fluxmon_rule_evaluations_total", MetricKind::Counter, "Rule evaluations", load(&rules.evaluations))
        .metric("fluxmon_rule_evaluation_failures_total", MetricKind::Counter, "Rule evaluations failed", load(&rules.evaluation_failures))
        .metric("fluxmon_rule_group_iterations_missed_total", MetricKind::Counter, "Rule group ticks skipped", load(&rules.missed_iterations))
        .metric("fluxmon_notifications_sent_total", MetricKind::Counter, "Notification batches delivered", load(&notify.notifications_sent))
        .metric("fluxmon_notifications_failed_total", MetricKind::Counter, "Notification batches dropped", load(&notify.notifications_failed))
        .metric("fluxmon_alert_groups", MetricKind::Gauge, "Active alert groups", app.dispatcher.group_count() as f64);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        w.finish(),
    )
}

async fn healthy(State(app): State<AppState>) -> (StatusCode, String) {
    match app.storage.health() {
        Ok(()) => (StatusCode::OK, "FluxMon is Healthy.\n".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use fluxmon_core::settings::Settings;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn start(config: Option<PathBuf>, dir: &TempDir) -> (AppState, Router) {
        let settings = match &config {
            Some(path) => Settings::load(path).unwrap(),
            None => Settings::default(),
        };
        let app = App::start(settings, config, Some(dir.path())).await.unwrap();
        (app.clone(), create_router(app))
    }

    fn encode(s: &str) -> String {
        let mut out = String::new();
        for b in s.bytes() {
            if b.is_ascii_alphanumeric() || b"-_.~".contains(&b) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02X}", b));
            }
        }
        out
    }

    async fn call(router: &Router, request: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        call(router, axum::http::Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post(router: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        call(router, axum::http::Request::post(uri).body(Body::from(body.to_string())).unwrap()).await
    }

    async fn import_requests(router: &Router) {
        let body = "# TYPE http_requests_total counter\n\
                    http_requests_total{job=\"api\",instance=\"a\"} 10 0\n\
                    http_requests_total{job=\"api\",instance=\"a\"} 15 60000\n\
                    http_requests_total{job=\"web\",instance=\"b\"} 3 60000\n";
        let (status, json) = post(router, "/api/v1/import", body).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["data"]["appended"], 3);
    }

    #[tokio::test]
    async fn test_instant_query() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let uri = format!(
            "/api/v1/query?query={}&time=60",
            encode(r#"rate(http_requests_total{job="api"}[1m])"#)
        );
        let (status, json) = get(&router, &uri).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["resultType"], "vector");
        let result = json["data"]["result"].as_array().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["metric"]["job"], "api");
        assert_eq!(result[0]["value"][0], 60.0);
        let v: f64 = result[0]["value"][1].as_str().unwrap().parse().unwrap();
        assert!((v - 0.0833).abs() < 0.001);

        let (_, json) = get(&router, "/api/v1/query?query=1%2B2&time=10").await;
        assert_eq!(json["data"]["resultType"], "scalar");
        assert_eq!(json["data"]["result"][1], "3");
    }

    #[tokio::test]
    async fn test_query_form_post() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let request = axum::http::Request::post("/api/v1/query")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("query={}&time=60", encode("sum by (job) (http_requests_total)"))))
            .unwrap();
        let (status, json) = call(&router, request).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["data"]["result"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_query_errors() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;

        let (status, json) = get(&router, &format!("/api/v1/query?query={}", encode("sum(up"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorType"], "bad_data");

        let (status, json) = get(&router, "/api/v1/query").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("query"));

        let (status, _) = get(&router, "/api/v1/query?query=up&time=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(&router, "/api/v1/query_range?query=up&start=10&end=0&step=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // no matching series is not an error
        let (status, json) = get(&router, "/api/v1/query?query=missing_metric").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["data"]["result"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_query() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let uri = format!(
            "/api/v1/query_range?query={}&start=0&end=60&step=30s",
            encode(r#"http_requests_total{job="api"}"#)
        );
        let (status, json) = get(&router, &uri).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["data"]["resultType"], "matrix");
        let values = json["data"]["result"][0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0][1], "10");
        assert_eq!(values[2][1], "15");
    }

    #[tokio::test]
    async fn test_metadata() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let (_, json) = get(&router, "/api/v1/labels").await;
        let names: Vec<&str> = json["data"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(names, vec!["__name__", "instance", "job"]);

        let (_, json) = get(&router, "/api/v1/label/job/values").await;
        assert_eq!(json["data"], json!(["api", "web"]));

        let uri = format!("/api/v1/series?match[]={}", encode(r#"http_requests_total{job="web"}"#));
        let (status, json) = get(&router, &uri).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        let series = json["data"].as_array().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0]["instance"], "b");

        let (status, _) = get(&router, "/api/v1/series").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_series() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let uri = format!("/api/v1/admin/tsdb/delete_series?match[]={}", encode(r#"{job="api"}"#));
        let (status, json) = post(&router, &uri, "").await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["data"]["deletedSeries"], 1);

        let (_, json) = get(&router, "/api/v1/query?query=http_requests_total&time=60").await;
        let result = json["data"]["result"].as_array().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["metric"]["job"], "web");
    }

    #[tokio::test]
    async fn test_import_rejects_bad_payload() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;

        let (status, json) = post(&router, "/api/v1/import", "metric{broken 1\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["errorType"], "bad_data");

        import_requests(&router).await;
        // replaying the same samples is rejected per sample, not per request
        let body = "http_requests_total{job=\"api\",instance=\"a\"} 12 30000\n";
        let (status, json) = post(&router, "/api/v1/import", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["appended"], 0);
        assert_eq!(json["data"]["out_of_order"], 1);
    }

    #[tokio::test]
    async fn test_reload() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("fluxmon.toml");
        std::fs::write(
            &config,
            r#"
[[rule_groups]]
name = "first"
[[rule_groups.rules]]
record = "job:up:sum"
expr = "sum by (job) (up)"
"#,
        )
        .unwrap();
        let (app, router) = start(Some(config.clone()), &dir).await;

        let (_, json) = get(&router, "/api/v1/rules").await;
        assert_eq!(json["data"]["groups"][0]["name"], "first");

        std::fs::write(
            &config,
            r#"
[[rule_groups]]
name = "second"
[[rule_groups.rules]]
alert = "Down"
expr = "up == 0"
for_secs = 60
"#,
        )
        .unwrap();
        let (status, json) = post(&router, "/-/reload", "").await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        let (_, json) = get(&router, "/api/v1/rules").await;
        assert_eq!(json["data"]["groups"][0]["name"], "second");
        assert_eq!(json["data"]["groups"][0]["rules"][0]["type"], "alerting");

        // an invalid file leaves the running configuration in place
        std::fs::write(&config, "[[rule_groups]]\nname = \"third\"\nbogus = 1\n").unwrap();
        let (status, json) = post(&router, "/-/reload", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["errorType"], "bad_data");
        let (_, json) = get(&router, "/api/v1/rules").await;
        assert_eq!(json["data"]["groups"][0]["name"], "second");
        assert_eq!(app.settings().rule_groups[0].name, "second");

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_rejects_clashing_groups() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("fluxmon.toml");
        std::fs::write(
            &config,
            r#"
[[scrape_configs]]
job_name = "node"
targets = ["127.0.0.1:1"]

[[rule_groups]]
name = "first"
"#,
        )
        .unwrap();
        let (app, router) = start(Some(config.clone()), &dir).await;

        // valid targets, but two groups end up with the same name
        std::fs::write(
            &config,
            r#"
[[scrape_configs]]
job_name = "other"
targets = ["127.0.0.1:2"]

[[rule_groups]]
name = "slo:Api"

[[slos]]
name = "Api"
error_ratio = "sum(rate(errors_total[$window]))"
objective = 0.99
"#,
        )
        .unwrap();
        let (status, json) = post(&router, "/-/reload", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", json);

        let targets = app.scrape.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].job, "node");
        let (_, json) = get(&router, "/api/v1/rules").await;
        assert_eq!(json["data"]["groups"].as_array().unwrap().len(), 1);
        assert_eq!(json["data"]["groups"][0]["name"], "first");
        assert_eq!(app.settings().scrape_configs[0].job_name, "node");

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_without_config_file() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        let (status, _) = post(&router, "/-/reload", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let dir = TempDir::new().unwrap();
        let (_app, router) = start(None, &dir).await;
        import_requests(&router).await;

        let response = router
            .clone()
            .oneshot(axum::http::Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let samples = exposition::parse(&text).unwrap();
        let appended = samples
            .iter()
            .find(|s| s.labels.metric_name() == Some("fluxmon_samples_appended_total"))
            .unwrap();
        assert_eq!(appended.value, 3.0);

        let response = router
            .clone()
            .oneshot(axum::http::Request::get("/-/healthy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, json) = get(&router, "/api/v1/targets").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["data"]["activeTargets"].as_array().unwrap().is_empty());
        let (_, json) = get(&router, "/api/v1/alerts").await;
        assert!(json["data"]["alerts"].as_array().unwrap().is_empty());
    }
}
