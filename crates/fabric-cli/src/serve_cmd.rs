//! The Monitoring HTTP API (spec component C12): the fabric's only external
//! interface, serving health, metrics, alert, and dashboard endpoints over
//! the runtime's registries and stores.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fabric_core::alerts::AlertManager;
use fabric_core::dashboard::{ChartKind, DashboardDescriptor, DashboardGenerator, Panel};
use fabric_core::metrics::{MetricFilter, MetricsStore, Reducer};
use fabric_core::registry::ResolverRegistry;
use fabric_core::resolver::HealthReport;
use fabric_core::task::ResolveContext;
use fabric_db::models::{Alert, AlertState, ErrorKind, MetricKind, MetricSample};
use fabric_db::queries::alerts as alerts_db;
use semver::Version;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// A dashboard rendered by a prior `/dashboards/generate` call, kept around
/// so `/dashboards/{id}` can serve it back without re-aggregating (spec
/// §4.10: the generator itself is stateless).
#[derive(Debug, Clone)]
struct StoredDashboard {
    title: String,
    html: String,
    generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub resolver_registry: Arc<ResolverRegistry>,
    pub metrics: Arc<MetricsStore>,
    pub alerts: Arc<AlertManager>,
    pub dashboards: Arc<DashboardGenerator>,
    dashboard_store: Arc<RwLock<HashMap<String, StoredDashboard>>>,
    pub pool: SqlitePool,
    pub health_check_timeout: Duration,
}

impl AppState {
    pub fn new(
        resolver_registry: Arc<ResolverRegistry>,
        metrics: Arc<MetricsStore>,
        alerts: Arc<AlertManager>,
        dashboards: Arc<DashboardGenerator>,
        pool: SqlitePool,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            resolver_registry,
            metrics,
            alerts,
            dashboards,
            dashboard_store: Arc::new(RwLock::new(HashMap::new())),
            pool,
            health_check_timeout,
        }
    }
}

/// Error response shape returned by every failing handler (spec §7:
/// "includes the kind as a machine-readable field in the body").
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    kind: Option<ErrorKind>,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }

    fn kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message).kind(ErrorKind::Validation)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message).kind(ErrorKind::NotFound)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message).kind(ErrorKind::State)
    }

    fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message).kind(ErrorKind::RateLimit)
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message).kind(ErrorKind::Resource)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind.map(|k| k.to_string()),
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::service_unavailable(err.to_string())
    }
}

/// Stamp every response with a correlation id (spec §6: "every response
/// carries a correlation id header").
async fn correlation_id_layer(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics/system", get(query_system_metrics))
        .route("/metrics/system/collect", post(collect_system_metrics))
        .route("/health/components", get(all_component_statuses))
        .route("/health/components/{id}", get(component_history))
        .route("/health/components/{id}/check", post(force_component_check))
        .route("/metrics/performance", get(query_performance_metrics))
        .route("/metrics/performance/record", post(record_performance_sample))
        .route("/alerts/active", get(active_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/dashboards", get(list_dashboards))
        .route("/dashboards/generate", post(generate_dashboard))
        .route("/dashboards/{id}", get(fetch_dashboard))
        .layer(axum::middleware::from_fn(correlation_id_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "monitoring API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn index() -> Html<String> {
    Html(
        "<!DOCTYPE html><html><head><title>fabric</title></head><body>\
<h1>fabric monitoring API</h1>\
<p>See <code>/health</code>, <code>/metrics/system</code>, <code>/health/components</code>, \
<code>/alerts/active</code>, <code>/dashboards</code>.</p>\
</body></html>"
            .to_string(),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// System metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SystemMetricsQuery {
    kind: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn query_system_metrics(
    State(state): State<AppState>,
    Query(q): Query<SystemMetricsQuery>,
) -> Result<Json<Vec<MetricSample>>, AppError> {
    let (since, until) = resolve_window(q.from, q.to);
    let mut samples = state
        .metrics
        .query(MetricKind::System, &q.kind, &MetricFilter::default(), since, until)
        .await?;
    if let Some(limit) = q.limit {
        if samples.len() > limit {
            samples = samples.split_off(samples.len() - limit);
        }
    }
    Ok(Json(samples))
}

#[derive(Debug, Deserialize)]
struct CollectQuery {
    r#type: String,
}

async fn collect_system_metrics(
    State(state): State<AppState>,
    Query(q): Query<CollectQuery>,
) -> Result<StatusCode, AppError> {
    let before = state.metrics.samples_dropped();
    state
        .metrics
        .append(MetricKind::System, q.r#type, 1.0, serde_json::json!({"trigger": "manual"}))
        .await?;
    if state.metrics.samples_dropped() > before {
        return Err(AppError::too_many_requests("metrics ingest is backpressured"));
    }
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Component health
// ---------------------------------------------------------------------------

fn parse_component_id(id: &str) -> (String, Option<Version>) {
    match id.split_once('@') {
        Some((name, version)) => (name.to_owned(), Version::parse(version).ok()),
        None => (id.to_owned(), None),
    }
}

async fn record_health_sample(metrics: &MetricsStore, name: &str, version: &Version, report: &HealthReport) {
    let _ = metrics
        .append(
            MetricKind::Health,
            format!("{name}@{version}"),
            if report.healthy { 1.0 } else { 0.0 },
            serde_json::json!({"name": name, "version": version.to_string()}),
        )
        .await;
}

async fn all_component_statuses(State(state): State<AppState>) -> Json<HashMap<String, HealthReport>> {
    let ctx = ResolveContext::new();
    let rollup = state.resolver_registry.health_rollup(&ctx, state.health_check_timeout).await;

    let mut unhealthy = 0.0_f64;
    let mut out = HashMap::with_capacity(rollup.len());
    for ((name, version), report) in rollup {
        if !report.healthy {
            unhealthy += 1.0;
        }
        record_health_sample(&state.metrics, &name, &version, &report).await;
        out.insert(format!("{name}@{version}"), report);
    }
    let _ = state
        .metrics
        .append(MetricKind::Performance, "resolver_unhealthy_count", unhealthy, serde_json::json!({}))
        .await;
    Json(out)
}

#[derive(Debug, Deserialize)]
struct ComponentHistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn component_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ComponentHistoryQuery>,
) -> Result<Json<Vec<MetricSample>>, AppError> {
    let (since, until) = resolve_window(q.from, q.to);
    let samples = state
        .metrics
        .query(MetricKind::Health, &id, &MetricFilter::default(), since, until)
        .await?;
    Ok(Json(samples))
}

#[derive(Debug, Deserialize)]
struct ForceCheckQuery {
    timeout_ms: Option<u64>,
}

async fn force_component_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ForceCheckQuery>,
) -> Result<Json<HealthReport>, AppError> {
    let (name, version) = parse_component_id(&id);
    let resolver = match version {
        Some(ref v) => state.resolver_registry.get(&name, v).await,
        None => state.resolver_registry.get_latest(&name).await,
    };
    let Some(resolver) = resolver else {
        return Err(AppError::not_found(format!("no component registered for {id}")));
    };
    let version = resolver.metadata().version;
    let timeout = q.timeout_ms.map(Duration::from_millis).unwrap_or(state.health_check_timeout);
    let ctx = ResolveContext::new();
    let report = match tokio::time::timeout(timeout, resolver.health_check(&ctx)).await {
        Ok(report) => report,
        Err(_) => HealthReport::unhealthy("health check timed out"),
    };
    record_health_sample(&state.metrics, &name, &version, &report).await;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Performance metrics
// ---------------------------------------------------------------------------

const PERFORMANCE_METRIC_NAME: &str = "latency_ms";

#[derive(Debug, Deserialize)]
struct PerformanceQuery {
    component: Option<String>,
    op: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn query_performance_metrics(
    State(state): State<AppState>,
    Query(q): Query<PerformanceQuery>,
) -> Result<Json<Vec<MetricSample>>, AppError> {
    let (since, until) = resolve_window(q.from, q.to);
    let mut filter = MetricFilter::default();
    if let Some(component) = q.component {
        filter = filter.label("component", component);
    }
    if let Some(op) = q.op {
        filter = filter.label("op", op);
    }
    let samples = state
        .metrics
        .query(MetricKind::Performance, PERFORMANCE_METRIC_NAME, &filter, since, until)
        .await?;
    Ok(Json(samples))
}

#[derive(Debug, Deserialize)]
struct PerformanceSampleRequest {
    component: String,
    op: String,
    value: f64,
}

async fn record_performance_sample(
    State(state): State<AppState>,
    Json(body): Json<PerformanceSampleRequest>,
) -> Result<StatusCode, AppError> {
    let before = state.metrics.samples_dropped();
    state
        .metrics
        .append(
            MetricKind::Performance,
            PERFORMANCE_METRIC_NAME,
            body.value,
            serde_json::json!({"component": body.component, "op": body.op}),
        )
        .await?;
    if state.metrics.samples_dropped() > before {
        return Err(AppError::too_many_requests("metrics ingest is backpressured"));
    }
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

async fn active_alerts(State(state): State<AppState>) -> Result<Json<Vec<Alert>>, AppError> {
    Ok(Json(state.alerts.active_alerts().await?))
}

fn parse_alert_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::bad_request(format!("invalid alert id {id}")))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_alert_id(&id)?;
    let existing = alerts_db::get(&state.pool, id).await?.ok_or_else(|| AppError::not_found("unknown alert"))?;
    if existing.state == AlertState::Resolved {
        return Err(AppError::conflict("alert is already resolved"));
    }
    state.alerts.acknowledge(id).await?;
    Ok(Json(serde_json::json!({"acknowledged": true})))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_alert_id(&id)?;
    let existing = alerts_db::get(&state.pool, id).await?.ok_or_else(|| AppError::not_found("unknown alert"))?;
    if existing.state == AlertState::Resolved {
        return Err(AppError::conflict("alert is already resolved"));
    }
    state.alerts.resolve(id).await?;
    Ok(Json(serde_json::json!({"resolved": true})))
}

// ---------------------------------------------------------------------------
// Dashboards
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DashboardSummary {
    id: String,
    title: String,
    generated_at: DateTime<Utc>,
}

async fn list_dashboards(State(state): State<AppState>) -> Json<Vec<DashboardSummary>> {
    let store = state.dashboard_store.read().await;
    let mut summaries: Vec<DashboardSummary> = store
        .iter()
        .map(|(id, d)| DashboardSummary {
            id: id.clone(),
            title: d.title.clone(),
            generated_at: d.generated_at,
        })
        .collect();
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(summaries)
}

#[derive(Debug, Deserialize)]
struct PanelRequest {
    title: String,
    metric_kind: Option<MetricKind>,
    metric_name: String,
    #[serde(default)]
    filter: BTreeMap<String, String>,
    bucket_secs: Option<u64>,
    reducer: Option<Reducer>,
    kind: ChartKind,
}

#[derive(Debug, Deserialize)]
struct DashboardGenerateRequest {
    id: String,
    title: String,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    panels: Vec<PanelRequest>,
}

async fn generate_dashboard(
    State(state): State<AppState>,
    Json(body): Json<DashboardGenerateRequest>,
) -> Result<Html<String>, AppError> {
    if body.panels.is_empty() {
        return Err(AppError::bad_request("dashboard must declare at least one panel"));
    }

    let mut descriptor = DashboardDescriptor::new(body.id.clone(), body.title.clone(), body.since, body.until);
    for panel_req in body.panels {
        let mut panel = Panel::new(panel_req.title, panel_req.metric_name, panel_req.kind);
        if let Some(kind) = panel_req.metric_kind {
            panel = panel.metric_kind(kind);
        }
        if let Some(bucket_secs) = panel_req.bucket_secs {
            panel = panel.bucket(Duration::from_secs(bucket_secs));
        }
        if let Some(reducer) = panel_req.reducer {
            panel = panel.reducer(reducer);
        }
        let mut filter = MetricFilter::default();
        for (k, v) in panel_req.filter {
            filter = filter.label(k, v);
        }
        panel = panel.filter(filter);
        descriptor = descriptor.panel(panel);
    }

    let html = state.dashboards.generate(&descriptor, &state.metrics).await?;
    let generated_at = Utc::now();
    state.dashboard_store.write().await.insert(
        body.id,
        StoredDashboard {
            title: body.title,
            html: html.clone(),
            generated_at,
        },
    );
    Ok(Html(html))
}

async fn fetch_dashboard(State(state): State<AppState>, Path(id): Path<String>) -> Result<Html<String>, AppError> {
    let store = state.dashboard_store.read().await;
    match store.get(&id) {
        Some(dashboard) => Ok(Html(dashboard.html.clone())),
        None => Err(AppError::not_found(format!("no dashboard named {id}"))),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn resolve_window(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> (DateTime<Utc>, DateTime<Utc>) {
    let until = to.unwrap_or_else(Utc::now);
    let since = from.unwrap_or_else(|| until - chrono::Duration::hours(1));
    (since, until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::alerts::{AlertRule, Comparator};
    use fabric_test_utils::{arc, create_test_store, EchoResolver};
    use tower::ServiceExt;

    async fn test_state() -> (AppState, fabric_test_utils::TestStore) {
        let store = create_test_store().await.unwrap();
        let metrics = Arc::new(MetricsStore::new(store.pool.clone(), 64, Duration::from_secs(1)));
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(arc(EchoResolver::new("echo"))).await.unwrap();
        let manager = Arc::new(AlertManager::new(store.pool.clone(), Arc::clone(&metrics), Vec::new()));
        let state = AppState::new(
            registry,
            metrics,
            manager,
            Arc::new(DashboardGenerator::new()),
            store.pool.clone(),
            Duration::from_secs(1),
        );
        (state, store)
    }

    async fn send_request(app: Router, req: axum::http::Request<axum::body::Body>) -> Response {
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);
        let req = axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-correlation-id"));
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn all_component_statuses_reports_registered_resolver() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);
        let req = axum::http::Request::builder()
            .uri("/health/components")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body.as_object().unwrap().contains_key("echo@1.0.0"));
    }

    #[tokio::test]
    async fn force_check_unknown_component_is_404() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/health/components/nope/check")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_then_query_performance_sample() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);

        let record_req = axum::http::Request::builder()
            .method("POST")
            .uri("/metrics/performance/record")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::json!({"component": "resolver", "op": "resolve", "value": 12.5}).to_string(),
            ))
            .unwrap();
        let response = send_request(app.clone(), record_req).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let query_req = axum::http::Request::builder()
            .uri("/metrics/performance?component=resolver&op=resolve")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, query_req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_unknown_alert_is_404() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/alerts/{}/acknowledge", Uuid::new_v4()))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn acknowledge_resolved_alert_is_409() {
        let (state, guard) = test_state().await;
        let id = Uuid::new_v4();
        alerts_db::open(
            &guard.pool,
            alerts_db::NewAlert {
                id,
                rule_name: "test_rule",
                severity: fabric_db::models::AlertSeverity::Medium,
                message: "test",
                opened_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        alerts_db::resolve(&guard.pool, id, Utc::now()).await.unwrap();

        let app = build_router(state);
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/alerts/{id}/acknowledge"))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn generate_then_fetch_dashboard() {
        let (state, _guard) = test_state().await;
        state
            .metrics
            .append(MetricKind::Performance, "latency_ms", 42.0, serde_json::json!({}))
            .await
            .unwrap();
        let app = build_router(state);

        let since = Utc::now() - chrono::Duration::hours(1);
        let until = Utc::now() + chrono::Duration::hours(1);
        let generate_req = axum::http::Request::builder()
            .method("POST")
            .uri("/dashboards/generate")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::json!({
                    "id": "ops",
                    "title": "Operations",
                    "since": since,
                    "until": until,
                    "panels": [
                        {"title": "Latency", "metric_name": "latency_ms", "kind": "line"}
                    ],
                })
                .to_string(),
            ))
            .unwrap();
        let response = send_request(app.clone(), generate_req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let fetch_req = axum::http::Request::builder()
            .uri("/dashboards/ops")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, fetch_req).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_dashboard_is_404() {
        let (state, _guard) = test_state().await;
        let app = build_router(state);
        let req = axum::http::Request::builder()
            .uri("/dashboards/does-not-exist")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = send_request(app, req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn comparator_is_reexported_for_preset_wiring() {
        let _ = AlertRule::new("x", "y", Comparator::GreaterThan, 0.0);
    }
}
