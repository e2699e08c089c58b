use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::ai::{AiResponder, AutoReplyDeps, OpenAiResponder};
use crate::config::{AppConfig, StoreBackend};
use crate::contacts::{ContactResolver, ProfileFetcher};
use crate::conversations::ConversationResolver;
use crate::error::{AppError, Result};
use crate::graph::{GraphClient, MessageSender};
use crate::media::{LocalMediaStore, MediaRelocator};
use crate::realtime::RealtimeHub;
use crate::store::{MemoryStore, PgStore, Store};
use crate::{webhook, widget};

/// Outbound integrations, swappable in tests.
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileFetcher>,
    pub relocator: Arc<dyn MediaRelocator>,
    pub sender: Arc<dyn MessageSender>,
    pub ai: Arc<dyn AiResponder>,
}

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub contacts: ContactResolver,
    pub conversations: ConversationResolver,
    pub relocator: Arc<dyn MediaRelocator>,
    pub media_files: LocalMediaStore,
    pub realtime: RealtimeHub,
    pub auto_reply: AutoReplyDeps,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, collaborators: Collaborators) -> Self {
        let realtime = RealtimeHub::new();
        Self {
            contacts: ContactResolver::new(store.clone(), collaborators.profiles),
            conversations: ConversationResolver::new(store.clone()),
            relocator: collaborators.relocator,
            media_files: LocalMediaStore::new(
                config.media_storage_dir.clone(),
                config.public_base_url.clone(),
            ),
            auto_reply: AutoReplyDeps {
                store: store.clone(),
                ai: collaborators.ai,
                sender: collaborators.sender,
                realtime: realtime.clone(),
            },
            realtime,
            store,
            config,
        }
    }

    /// Production wiring: Graph API for Meta, OpenAI for replies.
    pub fn with_live_integrations(config: AppConfig, store: Arc<dyn Store>) -> Self {
        let http = reqwest::Client::new();
        let media_files = LocalMediaStore::new(
            config.media_storage_dir.clone(),
            config.public_base_url.clone(),
        );
        let graph = Arc::new(GraphClient::new(
            http.clone(),
            config.graph_api_base.clone(),
            media_files,
        ));
        let ai = Arc::new(OpenAiResponder::new(
            http,
            &config.openai_base_url,
            &config.openai_api_key,
            &config.openai_model,
        ));
        Self::new(
            config,
            store,
            Collaborators {
                profiles: graph.clone(),
                relocator: graph.clone(),
                sender: graph,
                ai,
            },
        )
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn serve_stored_media(
    State(state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> Result<Response> {
    let Some((bytes, content_type)) = state.media_files.read(&file_name).await? else {
        return Err(AppError::NotFound("media file not found".into()));
    };
    let mut response = axum::body::Body::from(bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

fn widget_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

pub fn router(state: Arc<AppState>) -> Router {
    let widget_routes = Router::new()
        .route("/widget/config", get(widget::config))
        .route("/widget/conversation", get(widget::conversation))
        .route("/widget/message", post(widget::post_message))
        .route("/widget/stream", get(widget::stream))
        .layer(widget_cors());

    Router::new()
        .route("/health", get(health))
        .route("/api/media/{file_name}", get(serve_stored_media))
        .route(
            "/api/webhooks/whatsapp",
            get(webhook::whatsapp::verify).post(webhook::whatsapp::event),
        )
        .route(
            "/api/webhooks/messenger",
            get(webhook::messenger::verify).post(webhook::messenger::event),
        )
        .route(
            "/api/webhooks/instagram",
            get(webhook::instagram::verify).post(webhook::instagram::event),
        )
        .route(
            "/api/webhooks/meta",
            get(webhook::meta_verify).post(webhook::meta_event),
        )
        .route(
            "/api/channels/{channel_id}/webhook",
            get(webhook::channel_verify).post(webhook::channel_event),
        )
        .merge(widget_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Memory => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await
                .map_err(|err| {
                    anyhow::anyhow!(
                        "failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars): {err}"
                    )
                })?;
            let store = PgStore::new(db);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.media_storage_dir)
        .await
        .map_err(|err| {
            anyhow::anyhow!(
                "failed to create media storage directory {}: {err}",
                config.media_storage_dir.display()
            )
        })?;

    let store = open_store(&config).await?;
    let port = config.port;
    let state = Arc::new(AppState::with_live_integrations(config, store));
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("inbox ingest server running at http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
