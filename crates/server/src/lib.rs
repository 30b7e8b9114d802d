use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{ApiContext, Mutation};
use shared::{
    domain::{Category, CategoryId, Item, ItemId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChangeEvent, ChangeFilter, CreateCategoryRequest, CreateItemRequest, SetActiveRequest,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

/// Shared state of the HTTP and change feed handlers. Every write goes
/// through [`AppState::publish`] so the feed sees exactly what was stored.
#[derive(Clone)]
pub struct AppState {
    pub api: ApiContext,
    pub events: broadcast::Sender<ChangeEvent>,
}

impl AppState {
    pub fn new(storage: Storage, event_buffer: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer);
        Arc::new(Self {
            api: ApiContext { storage },
            events,
        })
    }

    fn publish<T>(&self, mutation: Mutation<T>) -> T {
        for event in mutation.events {
            // No receivers is fine: nobody is watching this table yet.
            let _ = self.events.send(event);
        }
        mutation.value
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    category_id: i64,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn build_router(state: Arc<AppState>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/categories", get(http_list_categories).post(http_create_category))
        .route(
            "/categories/:category_id/items",
            get(http_list_items).post(http_create_item),
        )
        .route(
            "/categories/:category_id/deactivate",
            post(http_deactivate_category),
        )
        .route("/items/:item_id/active", post(http_set_active))
        .route("/items/:item_id", axum::routing::delete(http_delete_item))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_request_bytes))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            warn!(%err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

fn status_for(error: &ApiError) -> StatusCode {
    match error.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    if error.code == ErrorCode::Internal {
        error!(message = %error.message, "request failed");
    }
    (status_for(&error), Json(error))
}

async fn http_list_categories(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Category>> {
    let categories = server_api::list_categories(&state.api)
        .await
        .map_err(reject)?;
    Ok(Json(categories))
}

async fn http_create_category(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCategoryRequest>,
) -> ApiResult<Category> {
    let category = server_api::create_category(&state.api, &req.name)
        .await
        .map_err(reject)?;
    Ok(Json(category))
}

async fn http_list_items(
    State(state): State<Arc<AppState>>,
    Path(category_id): Path<i64>,
) -> ApiResult<Vec<Item>> {
    let items = server_api::list_items(&state.api, CategoryId(category_id))
        .await
        .map_err(reject)?;
    Ok(Json(items))
}

async fn http_create_item(
    State(state): State<Arc<AppState>>,
    Path(category_id): Path<i64>,
    Json(req): Json<CreateItemRequest>,
) -> ApiResult<Item> {
    let mutation = server_api::create_item(&state.api, CategoryId(category_id), &req.text)
        .await
        .map_err(reject)?;
    Ok(Json(state.publish(mutation)))
}

async fn http_deactivate_category(
    State(state): State<Arc<AppState>>,
    Path(category_id): Path<i64>,
) -> ApiResult<Vec<Item>> {
    let mutation = server_api::deactivate_category(&state.api, CategoryId(category_id))
        .await
        .map_err(reject)?;
    Ok(Json(state.publish(mutation)))
}

async fn http_set_active(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
    Json(req): Json<SetActiveRequest>,
) -> ApiResult<Item> {
    let mutation = server_api::set_active(&state.api, ItemId(item_id), req.active)
        .await
        .map_err(reject)?;
    Ok(Json(state.publish(mutation)))
}

async fn http_delete_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
) -> ApiResult<Item> {
    let mutation = server_api::delete_item(&state.api, ItemId(item_id))
        .await
        .map_err(reject)?;
    Ok(Json(state.publish(mutation)))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let filter = ChangeFilter::category(CategoryId(q.category_id));
    ws.on_upgrade(move |socket| ws_connection(state, socket, filter))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    filter: ChangeFilter,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());
    info!(category_id = filter.category_id.0, "change feed subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    // Missed rows cannot be replayed; closing makes the client resync.
                    warn!(
                        category_id = filter.category_id.0,
                        skipped, "change feed subscriber lagged; closing"
                    );
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if !filter.matches(&event) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(category_id = filter.category_id.0, "change feed subscriber left");
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
