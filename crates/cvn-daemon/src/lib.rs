// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP/WebSocket control surface for the ComfyVN Studio control plane.
//!
//! [`build_state`] wires the application-scoped components (flags, bus,
//! registry, enforcer, budget, scheduler, providers) and [`build_app`]
//! mounts the versioned API over them. No component lives in a global;
//! everything threads through [`AppState`].

#![deny(unsafe_code)]

pub mod middleware;
mod ws;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path as AxPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use cvn_assets::{AssetFilter, AssetRegistry, RebuildOptions};
use cvn_budget::BudgetManager;
use cvn_config::StudioConfig;
use cvn_core::{hook_catalog, AssetType, JobId, JobSpec, Target};
use cvn_error::{ErrorBody, StudioError};
use cvn_events::{EventBus, HistoryFilter, WebhookConfig};
use cvn_flags::{FlagStore, FlagValue};
use cvn_policy::{Enforcer, LicenseScanner, NsfwScanner};
use cvn_providers::{ProviderRegistry, PROBE_INTERVAL};
use cvn_scenario::{RunRequest, ScenarioRunner};
use cvn_scheduler::{Scheduler, SchedulerConfig};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Application-scoped components threaded through every handler.
pub struct AppState {
    /// Loaded configuration.
    pub config: StudioConfig,
    /// Feature-flag authority.
    pub flags: FlagStore,
    /// The hook bus.
    pub bus: EventBus,
    /// Asset registry.
    pub registry: AssetRegistry,
    /// Policy enforcer.
    pub enforcer: Enforcer,
    /// Job scheduler handle.
    pub scheduler: Scheduler,
    /// Provider registry.
    pub providers: ProviderRegistry,
    /// Scenario runner.
    pub scenario: ScenarioRunner,
    /// Process start, for uptime.
    pub started_at: Instant,
}

impl AppState {
    /// Write a crash report for an unexpected failure and return the
    /// boundary error.
    pub fn internal(&self, context: &str, payload: serde_json::Value) -> StudioError {
        let crash_dir = self.config.paths().crash_dir;
        match cvn_telemetry::write_crash_report(&crash_dir, "internal_error", context, payload) {
            Ok(path) => error!(context, report = %path.display(), "internal error"),
            Err(e) => error!(context, error = %e, "internal error (crash report failed)"),
        }
        StudioError::internal(context)
    }
}

/// Adapter letting the budget manager evict the registry's sidecar cache.
struct RegistryCache(AssetRegistry);

impl cvn_budget::EvictableCache for RegistryCache {
    fn evict_lru(&self, max: usize) -> usize {
        self.0.cache_evict_lru(max)
    }
    fn len(&self) -> usize {
        self.0.cache_len()
    }
}

/// Build all components against `config`'s on-disk layout.
pub fn build_state(config: StudioConfig) -> anyhow::Result<Arc<AppState>> {
    let paths = config.paths();
    std::fs::create_dir_all(&paths.assets)?;
    std::fs::create_dir_all(&paths.playtest_dir)?;

    let bus = cvn_events::EventBus::open_with_capacity(&paths.hooks, config.hooks.history_capacity)?;
    let flags = FlagStore::open(&paths.flags)?;

    // Flag writes surface on the bus like every other mutation.
    {
        let flag_bus = bus.clone();
        flags.subscribe(Box::new(move |name, value, prev| {
            let mut payload = BTreeMap::new();
            payload.insert("name".to_string(), json!(name));
            payload.insert("value".to_string(), json!(value));
            payload.insert("previous".to_string(), json!(prev));
            let _ = flag_bus.publish("on_flag_changed", "flags", payload);
        }));
    }

    let registry = AssetRegistry::open(&paths.provenance, bus.clone())?;
    let enforcer = Enforcer::new(bus.clone());
    enforcer.register_scanner(Arc::new(NsfwScanner));
    enforcer.register_scanner(Arc::new(LicenseScanner));

    let mut budget_config = config.budget.clone();
    budget_config.lazy_eviction_enabled =
        budget_config.lazy_eviction_enabled || flags.is_enabled("lazy_eviction");
    let budget = BudgetManager::new(budget_config, bus.clone())
        .with_cache(Arc::new(RegistryCache(registry.clone())));

    let providers = ProviderRegistry::with_local_defaults();
    providers.spawn_prober(PROBE_INTERVAL);

    let scheduler = Scheduler::spawn(
        SchedulerConfig {
            max_attempts: config.scheduler.max_attempts,
            retry_backoff: Duration::from_millis(config.scheduler.retry_backoff_ms),
            cancel_grace: Duration::from_secs(config.scheduler.cancel_grace_secs),
            refresh_interval: Duration::from_secs(1),
        },
        &paths.jobs,
        budget,
        enforcer.clone(),
        flags.clone(),
        providers.clone(),
        bus.clone(),
    )?;

    let scenario = ScenarioRunner::new(bus.clone(), flags.clone());

    Ok(Arc::new(AppState {
        config,
        flags,
        bus,
        registry,
        enforcer,
        scheduler,
        providers,
        scenario,
        started_at: Instant::now(),
    }))
}

// ---------------------------------------------------------------------------
// Error adapter
// ---------------------------------------------------------------------------

/// Axum-facing wrapper around [`StudioError`].
#[derive(Debug)]
pub struct ApiError(pub StudioError);

impl From<StudioError> for ApiError {
    fn from(e: StudioError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Mount the full control-plane API over `state`.
pub fn build_app(state: Arc<AppState>) -> Router {
    let limiter = middleware::RateLimiter::new(
        state.config.rate_limit_per_minute,
        Duration::from_secs(60),
    );

    Router::new()
        .route("/health", get(cmd_health))
        .route("/status", get(cmd_status))
        .route("/api/schedule/submit", post(schedule_submit))
        .route("/api/schedule/claim", post(schedule_claim))
        .route("/api/schedule/start", post(schedule_start))
        .route("/api/schedule/complete", post(schedule_complete))
        .route("/api/schedule/fail", post(schedule_fail))
        .route("/api/schedule/requeue", post(schedule_requeue))
        .route("/api/schedule/cancel", post(schedule_cancel))
        .route("/api/schedule/state/{id}", get(schedule_state))
        .route("/api/schedule/board", get(schedule_board))
        .route("/api/schedule/health", get(schedule_health))
        .route("/api/schedule/ws", get(ws::schedule_ws))
        .route("/api/compute/advise", post(compute_advise))
        .route("/api/compute/costs", post(compute_costs))
        .route("/api/assets", get(assets_list))
        .route("/api/assets/register", post(assets_register))
        .route("/api/assets/upload", post(assets_upload))
        .route("/api/assets/rebuild", post(assets_rebuild))
        .route("/api/assets/{uid}", get(assets_get).delete(assets_remove))
        .route("/api/assets/{uid}/sidecar", get(assets_sidecar))
        .route("/api/modder/hooks", get(hooks_catalog_and_history))
        .route("/api/modder/hooks/webhooks", post(hooks_webhook_register))
        .route("/api/modder/hooks/webhooks/{id}", delete(hooks_webhook_remove))
        .route("/api/modder/hooks/test", post(hooks_test_fire))
        .route("/api/modder/hooks/ws", get(ws::hooks_ws))
        .route("/api/policy/enforce", post(policy_enforce))
        .route("/api/policy/audit", get(policy_audit))
        .route("/api/policy/status", get(policy_status))
        .route("/api/policy/ack", post(policy_ack))
        .route("/api/providers", get(providers_list).post(providers_upsert))
        .route("/api/providers/{id}", delete(providers_remove))
        .route("/api/scenario/run/step", post(scenario_run_step))
        .route("/api/playtest/run", post(playtest_run))
        .route("/api/flags", get(flags_list))
        .route("/api/flags/{name}", post(flags_set))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

/// Route paths mounted by [`build_app`], for `/status` and `studio doctor`.
pub fn route_catalog() -> Vec<&'static str> {
    vec![
        "/health",
        "/status",
        "/api/schedule/submit",
        "/api/schedule/claim",
        "/api/schedule/start",
        "/api/schedule/complete",
        "/api/schedule/fail",
        "/api/schedule/requeue",
        "/api/schedule/cancel",
        "/api/schedule/state/{id}",
        "/api/schedule/board",
        "/api/schedule/health",
        "/api/schedule/ws",
        "/api/compute/advise",
        "/api/compute/costs",
        "/api/assets",
        "/api/assets/register",
        "/api/assets/upload",
        "/api/assets/rebuild",
        "/api/assets/{uid}",
        "/api/assets/{uid}/sidecar",
        "/api/modder/hooks",
        "/api/modder/hooks/webhooks",
        "/api/modder/hooks/webhooks/{id}",
        "/api/modder/hooks/test",
        "/api/modder/hooks/ws",
        "/api/policy/enforce",
        "/api/policy/audit",
        "/api/policy/status",
        "/api/policy/ack",
        "/api/providers",
        "/api/providers/{id}",
        "/api/scenario/run/step",
        "/api/playtest/run",
        "/api/flags",
        "/api/flags/{name}",
    ]
}

// ---------------------------------------------------------------------------
// System handlers
// ---------------------------------------------------------------------------

async fn cmd_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn cmd_status(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let scheduler = state.scheduler.health().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": cvn_core::CONTRACT_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "log_path": state.config.paths().server_log.display().to_string(),
        "routers": route_catalog(),
        "bus": state.bus.status(),
        "scheduler": scheduler,
        "build": { "name": "comfyvn-studio", "version": cvn_core::CONTRACT_VERSION },
    })))
}

// ---------------------------------------------------------------------------
// Schedule handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(flatten)]
    spec: JobSpec,
    ack_token: Option<String>,
}

async fn schedule_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let record = state.scheduler.submit(body.spec, body.ack_token).await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ClaimBody {
    worker: String,
    #[serde(default)]
    target: Target,
    #[serde(default)]
    capabilities: Vec<String>,
}

async fn schedule_claim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimBody>,
) -> ApiResult<Option<cvn_core::JobRecord>> {
    let job = state
        .scheduler
        .claim(&body.worker, body.target, body.capabilities)
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    id: String,
    #[serde(default)]
    result: BTreeMap<String, serde_json::Value>,
}

async fn schedule_complete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompleteBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&body.id)?;
    Ok(Json(state.scheduler.complete(&id, body.result).await?))
}

#[derive(Debug, Deserialize)]
struct FailBody {
    id: String,
    error: String,
}

async fn schedule_fail(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FailBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&body.id)?;
    Ok(Json(state.scheduler.fail(&id, &body.error).await?))
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: String,
}

async fn schedule_requeue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IdBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&body.id)?;
    Ok(Json(state.scheduler.requeue(&id).await?))
}

async fn schedule_cancel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IdBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&body.id)?;
    Ok(Json(state.scheduler.cancel(&id).await?))
}

#[derive(Debug, Deserialize)]
struct StartBody {
    id: String,
    worker: String,
}

async fn schedule_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBody>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&body.id)?;
    Ok(Json(state.scheduler.start(&id, &body.worker).await?))
}

async fn schedule_state(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> ApiResult<cvn_core::JobRecord> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.state(&id).await?))
}

#[derive(Debug, Deserialize)]
struct BoardQuery {
    target: Option<Target>,
}

async fn schedule_board(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BoardQuery>,
) -> ApiResult<cvn_scheduler::BoardSnapshot> {
    Ok(Json(state.scheduler.board(q.target).await?))
}

async fn schedule_health(
    State(state): State<Arc<AppState>>,
) -> ApiResult<cvn_scheduler::SchedulerHealth> {
    Ok(Json(state.scheduler.health().await?))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw)
        .ok_or_else(|| ApiError(StudioError::invalid_input(format!("'{raw}' is not a job id"))))
}

// ---------------------------------------------------------------------------
// Compute handlers
// ---------------------------------------------------------------------------

async fn compute_advise(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<serde_json::Value> {
    let advice = state.scheduler.advise(spec).await?;
    Ok(Json(json!({ "advice": advice })))
}

async fn compute_costs(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<cvn_core::CostEstimate> {
    Ok(Json(state.scheduler.preview_cost(spec).await?))
}

// ---------------------------------------------------------------------------
// Asset handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AssetListQuery {
    hash: Option<String>,
    /// Comma-separated all-of tag list.
    tags: Option<String>,
    text: Option<String>,
    #[serde(rename = "type")]
    asset_type: Option<AssetType>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn assets_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AssetListQuery>,
) -> ApiResult<serde_json::Value> {
    let filter = AssetFilter {
        hash: q.hash,
        tags: q.tags.map(|t| {
            t.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }),
        text: q.text,
        asset_type: q.asset_type,
        limit: q.limit,
        offset: q.offset,
    };
    let page = state.registry.list(&filter);
    Ok(Json(json!({ "items": page.items, "total": page.total })))
}

async fn assets_get(
    State(state): State<Arc<AppState>>,
    AxPath(uid): AxPath<String>,
) -> ApiResult<cvn_core::AssetRecord> {
    state
        .registry
        .get(&uid)
        .map(Json)
        .ok_or_else(|| ApiError(StudioError::not_found(format!("asset {uid}"))))
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    path: String,
    #[serde(rename = "type", default)]
    asset_type: AssetType,
    #[serde(default)]
    meta: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    provenance: BTreeMap<String, serde_json::Value>,
    ack_token: Option<String>,
}

async fn assets_register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<cvn_core::AssetRecord> {
    if state.flags.is_enabled("policy_gate_assets") {
        let payload = json!({ "path": &body.path, "meta": &body.meta });
        let evaluation =
            state
                .enforcer
                .evaluate("assets.register", payload, body.ack_token.as_deref());
        if !evaluation.allow {
            return Err(ApiError(
                StudioError::policy_blocked("asset registration blocked by advisory")
                    .with_details(json!({ "findings": evaluation.findings })),
            ));
        }
    }

    let registry = state.registry.clone();
    let record = tokio::task::spawn_blocking(move || {
        registry.register_file(
            std::path::Path::new(&body.path),
            body.asset_type,
            body.meta,
            body.provenance,
        )
    })
    .await
    .map_err(|e| ApiError(state.internal("asset register task", json!({"error": e.to_string()}))))?
    .map_err(map_asset_error)?;
    Ok(Json(record))
}

async fn assets_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<cvn_core::AssetRecord> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut asset_type = AssetType::Other;
    let mut meta: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(StudioError::invalid_input(format!("multipart: {e}"))))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let name = field
                    .file_name()
                    .map(sanitize_filename)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        ApiError(StudioError::invalid_input("upload needs a file name"))
                    })?;
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError(StudioError::invalid_input(format!("upload read: {e}")))
                })?;
                file = Some((name, bytes.to_vec()));
            }
            "type" => {
                let text = field.text().await.unwrap_or_default();
                asset_type = serde_json::from_value(json!(text))
                    .map_err(|_| ApiError(StudioError::invalid_input("unknown asset type")))?;
            }
            "meta" => {
                let text = field.text().await.unwrap_or_default();
                meta = serde_json::from_str(&text)
                    .map_err(|e| ApiError(StudioError::invalid_input(format!("meta: {e}"))))?;
            }
            _ => {}
        }
    }

    let (name, bytes) = file
        .ok_or_else(|| ApiError(StudioError::invalid_input("multipart field 'file' missing")))?;

    let dest_dir = state.config.paths().assets.join(asset_type.dir_name());
    let registry = state.registry.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<_, cvn_assets::AssetError> {
        std::fs::create_dir_all(&dest_dir).map_err(|source| cvn_assets::AssetError::Io {
            path: dest_dir.clone(),
            source,
        })?;
        let dest = dest_dir.join(&name);
        std::fs::write(&dest, &bytes).map_err(|source| cvn_assets::AssetError::Io {
            path: dest.clone(),
            source,
        })?;
        registry.register_file(
            &dest,
            asset_type,
            meta,
            BTreeMap::from([("source".to_string(), json!("upload"))]),
        )
    })
    .await
    .map_err(|e| ApiError(state.internal("asset upload task", json!({"error": e.to_string()}))))?
    .map_err(map_asset_error)?;
    Ok(Json(record))
}

async fn assets_remove(
    State(state): State<Arc<AppState>>,
    AxPath(uid): AxPath<String>,
) -> ApiResult<serde_json::Value> {
    state.registry.remove(&uid).map_err(map_asset_error)?;
    Ok(Json(json!({ "removed": uid })))
}

async fn assets_sidecar(
    State(state): State<Arc<AppState>>,
    AxPath(uid): AxPath<String>,
) -> ApiResult<serde_json::Value> {
    Ok(Json(state.registry.sidecar(&uid).map_err(map_asset_error)?))
}

#[derive(Debug, Deserialize)]
struct RebuildBody {
    root: Option<String>,
    #[serde(flatten)]
    options: RebuildOptions,
}

async fn assets_rebuild(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RebuildBody>,
) -> ApiResult<cvn_assets::RebuildSummary> {
    let root = body
        .root
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| state.config.paths().assets);
    let registry = state.registry.clone();
    let summary = tokio::task::spawn_blocking(move || registry.rebuild(&root, &body.options))
        .await
        .map_err(|e| ApiError(state.internal("rebuild task", json!({"error": e.to_string()}))))?
        .map_err(map_asset_error)?;
    Ok(Json(summary))
}

fn sanitize_filename(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

fn map_asset_error(e: cvn_assets::AssetError) -> ApiError {
    let err = match &e {
        cvn_assets::AssetError::NotFound(uid) => StudioError::not_found(format!("asset {uid}")),
        cvn_assets::AssetError::Io { .. } => StudioError::invalid_input(e.to_string()),
        cvn_assets::AssetError::Json(_) => StudioError::internal(e.to_string()),
    };
    ApiError(err)
}

// ---------------------------------------------------------------------------
// Hook handlers
// ---------------------------------------------------------------------------

async fn hooks_catalog_and_history(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<HistoryFilter>,
) -> ApiResult<serde_json::Value> {
    let history = state.bus.history(&filter);
    Ok(Json(json!({
        "catalog": hook_catalog(),
        "history": history,
    })))
}

async fn hooks_webhook_register(
    State(state): State<Arc<AppState>>,
    Json(config): Json<WebhookConfig>,
) -> ApiResult<cvn_events::WebhookInfo> {
    if !state.flags.is_enabled("enable_webhooks") {
        return Err(ApiError(StudioError::feature_disabled("enable_webhooks")));
    }
    if config.url.is_empty() || config.secret.is_empty() {
        return Err(ApiError(StudioError::invalid_input(
            "webhook needs url and secret",
        )));
    }
    Ok(Json(state.bus.webhook_register(config)))
}

async fn hooks_webhook_remove(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<Uuid>,
) -> ApiResult<serde_json::Value> {
    if state.bus.webhook_remove(id) {
        Ok(Json(json!({ "removed": id })))
    } else {
        Err(ApiError(StudioError::not_found(format!("webhook {id}"))))
    }
}

async fn hooks_test_fire(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let mut payload = BTreeMap::new();
    payload.insert("op".to_string(), json!("test_fire"));
    payload.insert("actor".to_string(), json!("api"));
    payload.insert("target".to_string(), json!("modder_hooks"));
    let seq = state
        .bus
        .publish("on_collab_operation", "api", payload)
        .map_err(|e| ApiError(StudioError::invalid_input(e.to_string())))?;
    Ok(Json(json!({ "seq": seq })))
}

// ---------------------------------------------------------------------------
// Policy handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnforceBody {
    action: String,
    #[serde(default)]
    payload: serde_json::Value,
    ack_token: Option<String>,
}

async fn policy_enforce(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnforceBody>,
) -> ApiResult<cvn_policy::Evaluation> {
    Ok(Json(state.enforcer.evaluate(
        &body.action,
        body.payload,
        body.ack_token.as_deref(),
    )))
}

async fn policy_audit(State(state): State<Arc<AppState>>) -> ApiResult<Vec<cvn_policy::AuditEntry>> {
    Ok(Json(state.enforcer.audit()))
}

async fn policy_status(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    Ok(Json(json!({
        "scanners": state.enforcer.scanner_ids(),
        "acks": state.enforcer.acks().len(),
        "audit_entries": state.enforcer.audit().len(),
    })))
}

#[derive(Debug, Deserialize)]
struct AckBody {
    token: String,
    user: String,
    reason: String,
}

async fn policy_ack(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AckBody>,
) -> ApiResult<serde_json::Value> {
    if body.token.is_empty() || body.user.is_empty() {
        return Err(ApiError(StudioError::invalid_input(
            "ack needs token and user",
        )));
    }
    state.enforcer.ack(body.token.clone(), body.user, body.reason);
    Ok(Json(json!({ "acknowledged": body.token })))
}

// ---------------------------------------------------------------------------
// Provider handlers
// ---------------------------------------------------------------------------

async fn providers_list(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<cvn_core::ProviderRecord>> {
    Ok(Json(state.providers.list()))
}

async fn providers_upsert(
    State(state): State<Arc<AppState>>,
    Json(record): Json<cvn_core::ProviderRecord>,
) -> ApiResult<cvn_core::ProviderRecord> {
    if record.id.is_empty() {
        return Err(ApiError(StudioError::invalid_input("provider id required")));
    }
    state.providers.upsert(record.clone());
    Ok(Json(record))
}

async fn providers_remove(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> ApiResult<serde_json::Value> {
    if state.providers.remove(&id) {
        Ok(Json(json!({ "removed": id })))
    } else {
        Err(ApiError(StudioError::not_found(format!("provider {id}"))))
    }
}

// ---------------------------------------------------------------------------
// Scenario handlers
// ---------------------------------------------------------------------------

async fn scenario_run_step(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> ApiResult<cvn_scenario::RunTrace> {
    let trace = state
        .scenario
        .run(&request)
        .map_err(|e| ApiError(StudioError::invalid_input(e.to_string())))?;
    Ok(Json(trace))
}

async fn playtest_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> ApiResult<cvn_scenario::RunTrace> {
    let trace = state
        .scenario
        .run(&request)
        .map_err(|e| ApiError(StudioError::invalid_input(e.to_string())))?;

    // Playtests keep their trace on disk for later diffing.
    let path = state
        .config
        .paths()
        .playtest_dir
        .join(format!("{}.trace.json", trace.run_id));
    let rendered = serde_json::to_vec_pretty(&trace)
        .map_err(|e| ApiError(state.internal("trace serialize", json!({"error": e.to_string()}))))?;
    if let Err(e) = std::fs::write(&path, rendered) {
        return Err(ApiError(state.internal(
            "trace write",
            json!({"path": path.display().to_string(), "error": e.to_string()}),
        )));
    }
    info!(run = %trace.run_id, path = %path.display(), "playtest trace written");
    Ok(Json(trace))
}

// ---------------------------------------------------------------------------
// Flag handlers
// ---------------------------------------------------------------------------

async fn flags_list(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    Ok(Json(json!(*state.flags.snapshot())))
}

async fn flags_set(
    State(state): State<Arc<AppState>>,
    AxPath(name): AxPath<String>,
    Json(value): Json<FlagValue>,
) -> ApiResult<serde_json::Value> {
    let prev = state
        .flags
        .set(&name, value.clone())
        .map_err(|e| ApiError(state.internal("flag persist", json!({"error": e.to_string()}))))?;
    Ok(Json(json!({ "name": name, "value": value, "previous": prev })))
}

