use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use narrative_tagger_api::{
    InsertRecordRequest, NarrativeTaggerApi, RefreshResult, TagRecordRequest, TaggerConfig,
    UserTaggedCount, API_CONTRACT_VERSION,
};
use narrative_tagger_core::{LeaderboardEntry, Record, TaggerError, TaggingStats};
use narrative_tagger_store::{CommitReceipt, FlushOutcome};
use narrative_tagger_store_sqlite::SqliteTable;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: NarrativeTaggerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TopicQuery {
    topic: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    records: usize,
    snapshot_version: u64,
}

#[derive(Debug, Clone, Serialize)]
struct PendingWritesResponse {
    links: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "narrative-tagger-service")]
#[command(about = "Local HTTP service for narrative video tagging")]
struct Args {
    #[arg(long, default_value = "./narrative_tagger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Optional YAML file with tagger settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: "internal_error",
            error: message.into(),
        }
    }
}

impl From<TaggerError> for ServiceError {
    fn from(err: TaggerError) -> Self {
        let status = match err {
            TaggerError::Validation(_) | TaggerError::InvalidResult(_) => StatusCode::BAD_REQUEST,
            TaggerError::NotFound(_) | TaggerError::Exhausted(_) => StatusCode::NOT_FOUND,
            TaggerError::DuplicateLink(_)
            | TaggerError::AlreadyTagged { .. }
            | TaggerError::SlotConflict(_) => StatusCode::CONFLICT,
            TaggerError::Upstream(_) | TaggerError::MalformedSource(_) => StatusCode::BAD_GATEWAY,
        };
        if err.is_absence() {
            tracing::debug!(code = err.code(), error = %err, "request found nothing");
        } else {
            tracing::info!(code = err.code(), status = status.as_u16(), error = %err, "request rejected");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: err.code(),
            error: err.to_string(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a call that may block on the source or the writer lock off the async
/// worker threads.
async fn blocking<T, F>(call: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, TaggerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| ServiceError::internal(format!("blocking task failed: {err}")))?
        .map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/records", post(records_insert))
        .route("/v1/records/tag", post(records_tag))
        .route("/v1/records/tagged", get(records_tagged))
        .route("/v1/records/by-topic", get(records_by_topic))
        .route("/v1/users/:user/next", get(users_next))
        .route("/v1/users/:user/tagged-count", get(users_tagged_count))
        .route("/v1/stats", get(stats))
        .route("/v1/stats/leaderboard", get(stats_leaderboard))
        .route("/v1/topics", get(topics))
        .route("/v1/topics/:topic/narratives", get(topic_narratives))
        .route("/v1/sync/refresh", post(sync_refresh))
        .route("/v1/sync/pending", get(sync_pending))
        .route("/v1/sync/flush", post(sync_flush))
        .with_state(state)
}

fn load_config(path: Option<&std::path::Path>) -> Result<TaggerConfig> {
    match path {
        Some(path) => TaggerConfig::from_yaml_file(path),
        None => Ok(TaggerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let table = SqliteTable::open(&args.db)
        .with_context(|| format!("failed to open narrative table {}", args.db.display()))?;
    let api = NarrativeTaggerApi::new(Arc::new(table), config);

    let initial = api.clone();
    match blocking(move || initial.refresh()).await {
        Ok(loaded) => tracing::info!(records = loaded.records, "initial snapshot loaded"),
        Err(err) => tracing::warn!(code = err.code, error = %err.error, "initial refresh failed"),
    }

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "narrative tagger service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let stats = state.api.get_stats();
    Json(envelope(HealthResponse {
        status: "ok",
        records: stats.totals.records,
        snapshot_version: stats.snapshot_version,
    }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn records_insert(
    State(state): State<ServiceState>,
    Json(request): Json<InsertRecordRequest>,
) -> Result<Json<ServiceEnvelope<CommitReceipt>>, ServiceError> {
    let receipt = blocking(move || state.api.insert_record(request)).await?;
    Ok(Json(envelope(receipt)))
}

async fn records_tag(
    State(state): State<ServiceState>,
    Json(request): Json<TagRecordRequest>,
) -> Result<Json<ServiceEnvelope<CommitReceipt>>, ServiceError> {
    let receipt = blocking(move || state.api.tag_record(request)).await?;
    Ok(Json(envelope(receipt)))
}

async fn records_tagged(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<Record>>> {
    Json(envelope(state.api.tagged_records()))
}

async fn records_by_topic(
    State(state): State<ServiceState>,
    Query(query): Query<TopicQuery>,
) -> Json<ServiceEnvelope<Vec<Record>>> {
    Json(envelope(state.api.records_by_topic(&query.topic)))
}

async fn users_next(
    State(state): State<ServiceState>,
    Path(user): Path<String>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let record = blocking(move || state.api.next_for_user(&user)).await?;
    Ok(Json(envelope(record)))
}

async fn users_tagged_count(
    State(state): State<ServiceState>,
    Path(user): Path<String>,
) -> Result<Json<ServiceEnvelope<UserTaggedCount>>, ServiceError> {
    let count = state.api.user_tagged_count(&user)?;
    Ok(Json(envelope(count)))
}

async fn stats(State(state): State<ServiceState>) -> Json<ServiceEnvelope<TaggingStats>> {
    Json(envelope(state.api.get_stats()))
}

async fn stats_leaderboard(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<LeaderboardEntry>>> {
    Json(envelope(state.api.get_stats().leaderboard))
}

async fn topics(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<String>>> {
    Json(envelope(state.api.topics()))
}

async fn topic_narratives(
    State(state): State<ServiceState>,
    Path(topic): Path<String>,
) -> Json<ServiceEnvelope<Vec<String>>> {
    Json(envelope(state.api.narratives(&topic)))
}

async fn sync_refresh(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RefreshResult>>, ServiceError> {
    let result = blocking(move || state.api.refresh()).await?;
    Ok(Json(envelope(result)))
}

async fn sync_pending(State(state): State<ServiceState>) -> Json<ServiceEnvelope<PendingWritesResponse>> {
    Json(envelope(PendingWritesResponse { links: state.api.pending_writes() }))
}

async fn sync_flush(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<FlushOutcome>>>, ServiceError> {
    let outcomes = blocking(move || Ok(state.api.flush_pending())).await?;
    Ok(Json(envelope(outcomes)))
}
