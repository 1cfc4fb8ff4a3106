use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    error::ChatError,
    message::{Direction, Message, Page, PageRequest},
    service::ChatService,
};

/// Header carrying the caller's member id, already authenticated upstream.
pub const MEMBER_HEADER: &str = "UUID";

// -----------------------------------------------------------------------------
// Request / response types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    /// `createdAt`, optionally followed by `,asc` or `,desc`.
    pub sort: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadResponse {
    pub room_id: String,
    pub member_id: String,
    pub count: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::RoomNotFound(_) | ChatError::MembershipNotFound { .. } => StatusCode::NOT_FOUND,
            ChatError::InvalidPayload { .. } | ChatError::InvalidPageRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::StoreUnavailable(_) => {
                error!("Store failure: {:#}", self);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl PageQuery {
    pub fn into_request(self, default_size: u32) -> Result<PageRequest, ChatError> {
        let direction = match self.sort.as_deref().map(str::trim) {
            None | Some("") => Direction::Descending,
            Some(sort) => {
                let mut parts = sort.split(',').map(str::trim);
                let field = parts.next().unwrap_or_default();
                if field != "createdAt" {
                    return Err(ChatError::InvalidPageRequest(format!(
                        "cannot sort by {:?}",
                        field
                    )));
                }
                match parts.next().map(str::to_ascii_lowercase).as_deref() {
                    None | Some("desc") => Direction::Descending,
                    Some("asc") => Direction::Ascending,
                    Some(other) => {
                        return Err(ChatError::InvalidPageRequest(format!(
                            "unknown sort direction {:?}",
                            other
                        )))
                    }
                }
            }
        };

        Ok(PageRequest::new(self.size.unwrap_or(default_size))
            .page(self.page.unwrap_or(0))
            .direction(direction))
    }
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct ChatState {
    pub service: ChatService,
    pub default_page_size: u32,
}

pub fn router(service: ChatService, default_page_size: u32) -> Router {
    let state = Arc::new(ChatState {
        service,
        default_page_size,
    });

    Router::new()
        .route("/chat", post(send_handler))
        .route("/chat/stream/:room_id", get(stream_handler))
        .route("/chat/page/:room_id", get(page_handler))
        .route("/chat/unread/:room_id", get(unread_handler))
        .route("/chat/read/:room_id", post(read_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Missing header means an empty id, which no room knows.
fn member_id(headers: &HeaderMap) -> String {
    headers
        .get(MEMBER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn send_handler(
    State(state): State<Arc<ChatState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Json<Message>, ChatError> {
    let sender = member_id(&headers);
    let message = state
        .service
        .send_tagged(&request.room_id, &sender, &request.kind, request.msg)
        .await?;
    Ok(Json(message))
}

async fn page_handler(
    State(state): State<Arc<ChatState>>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<Page>, ChatError> {
    let request = query.into_request(state.default_page_size)?;
    let page = state
        .service
        .get_page(&room_id, &member_id(&headers), request)
        .await?;
    Ok(Json(page))
}

async fn stream_handler(
    State(state): State<Arc<ChatState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::BoxError>>>, ChatError> {
    let member = member_id(&headers);
    let subscription = state.service.get_stream(&room_id, &member).await?;
    info!(room_id = %room_id, member = %member, "New SSE connection established");

    // axum drops the stream when the client goes away, which detaches the
    // subscription from the hub.
    let stream = subscription.into_stream().map(|message| {
        Event::default()
            .event("message")
            .json_data(&message)
            .map_err(axum::BoxError::from)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn unread_handler(
    State(state): State<Arc<ChatState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<UnreadResponse>, ChatError> {
    let member = member_id(&headers);
    let count = state.service.unread_count(&room_id, &member).await?;
    Ok(Json(UnreadResponse {
        room_id,
        member_id: member,
        count,
    }))
}

async fn read_handler(
    State(state): State<Arc<ChatState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ChatError> {
    state.service.mark_read(&room_id, &member_id(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}
