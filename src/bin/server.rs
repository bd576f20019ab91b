//! M3A Memory Server
//!
//! HTTP API and event stream for the memory engine.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3a_memory::{
    AffectQuery, Config, ConsolidationTrigger, CurateRequest, Error, ErrorKind, IngestRequest,
    MemoryStore, RetrievalQuery, SalienceQuery,
};

type SharedState = Arc<MemoryStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting M3A Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let store = Arc::new(MemoryStore::open(config.clone())?);
    let shutdown = CancellationToken::new();

    if config.consolidation_interval_secs > 0 {
        spawn_scheduler(
            store.clone(),
            Duration::from_secs(config.consolidation_interval_secs),
            shutdown.clone(),
        );
    }

    let app = Router::new()
        .route("/health", get(health))
        // L1
        .route("/chats/:chat_id/river", get(river_entries).post(ingest))
        .route("/chats/:chat_id/river/stats", get(river_stats))
        .route("/chats/:chat_id/stats", get(stats))
        // Queries
        .route("/retrieve", post(retrieve))
        .route("/chats/:chat_id/search", get(search))
        .route("/chats/:chat_id/affect", get(affect_entries))
        .route("/chats/:chat_id/salience", get(salience_entries))
        .route("/graph/related", get(related_entities))
        // Curation and consolidation
        .route("/curate", post(curate))
        .route("/chats/:chat_id/consolidate", post(consolidate))
        .route("/chats/:chat_id/runs", get(consolidation_runs))
        // Config and events
        .route("/config", get(get_config).patch(update_config))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(store);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

/// Consolidate every known chat on a fixed interval until `shutdown` fires
fn spawn_scheduler(store: SharedState, every: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let chat_ids = match store.chat_ids() {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduled consolidation could not list chats");
                    continue;
                }
            };
            for chat_id in chat_ids {
                let run = store
                    .consolidate_with_cancel(
                        &chat_id,
                        ConsolidationTrigger::Scheduled,
                        shutdown.child_token(),
                    )
                    .await;
                match run {
                    Ok(run) => tracing::debug!(
                        chat_id = %chat_id,
                        promoted = run.promoted,
                        pruned = run.pruned,
                        "scheduled consolidation finished"
                    ),
                    Err(e) if e.kind() == ErrorKind::Conflict => {
                        tracing::debug!(chat_id = %chat_id, "consolidation already running")
                    }
                    Err(e) => {
                        tracing::warn!(chat_id = %chat_id, error = %e, "scheduled run failed")
                    }
                }
            }
        }
    });
}

// === Errors ===

/// An engine error rendered as `{kind, message}` with a matching status
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({ "kind": kind, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Decode a JSON body so shape errors surface as VALIDATION_ERROR
fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError(Error::validation(e.to_string())))
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- L1 ---

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn ingest(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: IngestRequest = decode(body)?;
    let entry = store.ingest(&chat_id, request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "entry": entry }))))
}

async fn river_entries(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Value> {
    let entries = store.river_entries(&chat_id, query.limit)?;
    Ok(Json(json!({ "entries": entries })))
}

async fn river_stats(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
) -> ApiResult<m3a_memory::RiverStats> {
    Ok(Json(store.river_stats(&chat_id)?))
}

async fn stats(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
) -> ApiResult<m3a_memory::MemoryStats> {
    Ok(Json(store.stats(&chat_id)?))
}

// --- Queries ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    memories: Vec<m3a_memory::RankedCandidate>,
    prompt: String,
}

async fn retrieve(
    State(store): State<SharedState>,
    Json(body): Json<Value>,
) -> ApiResult<RetrieveResponse> {
    let query: RetrievalQuery = decode(body)?;
    let result = store.retrieve(&query)?;
    Ok(Json(RetrieveResponse {
        prompt: result.format_for_prompt(),
        memories: result.memories,
    }))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    top_k: Option<usize>,
}

async fn search(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Value> {
    let results = store.search_lexical(&chat_id, &query.q, query.top_k)?;
    Ok(Json(json!({ "results": results })))
}

async fn affect_entries(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(filter): Query<AffectQuery>,
) -> ApiResult<Value> {
    let entries = store.affect_entries(&chat_id, &filter)?;
    Ok(Json(json!({ "entries": entries })))
}

async fn salience_entries(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(filter): Query<SalienceQuery>,
) -> ApiResult<Value> {
    let entries = store.salience_entries(&chat_id, &filter)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
struct RelatedQuery {
    entity: String,
    chat_id: Option<String>,
    hops: Option<usize>,
}

async fn related_entities(
    State(store): State<SharedState>,
    Query(query): Query<RelatedQuery>,
) -> ApiResult<Value> {
    let related = store.related_entities(&query.entity, query.chat_id.as_deref(), query.hops)?;
    Ok(Json(json!({ "entities": related })))
}

// --- Curation & consolidation ---

async fn curate(
    State(store): State<SharedState>,
    Json(body): Json<Value>,
) -> ApiResult<m3a_memory::CurationOutcome> {
    let request: CurateRequest = decode(body)?;
    Ok(Json(store.curate(request).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ConsolidateBody {
    trigger: Option<ConsolidationTrigger>,
}

async fn consolidate(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<Value> {
    let body: ConsolidateBody = match body {
        Some(Json(value)) if !value.is_null() => decode(value)?,
        _ => ConsolidateBody::default(),
    };
    let trigger = body.trigger.unwrap_or(ConsolidationTrigger::Manual);
    // the run keeps going if the client disconnects
    let run = tokio::spawn(async move { store.consolidate(&chat_id, trigger).await })
        .await
        .map_err(|e| Error::internal(e.to_string()))??;
    Ok(Json(json!({ "run": run })))
}

async fn consolidation_runs(
    State(store): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Value> {
    let runs = store.consolidation_runs(&chat_id, query.limit)?;
    Ok(Json(json!({ "runs": runs })))
}

// --- Config & events ---

async fn get_config(State(store): State<SharedState>) -> ApiResult<m3a_memory::MemoryConfig> {
    Ok(Json(store.config()?))
}

async fn update_config(
    State(store): State<SharedState>,
    Json(patch): Json<Value>,
) -> ApiResult<m3a_memory::MemoryConfig> {
    Ok(Json(store.update_config(patch)?))
}

/// Server-sent events of every published memory event
async fn events(
    State(store): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = store.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    match Event::default().event(envelope.event.name()).json_data(&envelope) {
                        Ok(event) => return Some((Ok(event), receiver)),
                        Err(e) => tracing::warn!(error = %e, "dropping unencodable event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
