use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::header::RETRY_AFTER;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use kcart_agent::{AgentRuntime, TurnRequest};
use kcart_core::errors::{ErrorCode, InterfaceError};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ChatState {
    runtime: Arc<AgentRuntime>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Rate-limit identity of the caller: first `x-forwarded-for` hop, else the
/// socket peer address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientKey(pub Option<String>);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(address)| address.ip().to_string());
        Ok(Self(forwarded.or(peer)))
    }
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new().route("/api/v1/chat", post(chat)).with_state(ChatState { runtime })
}

pub async fn chat(
    State(state): State<ChatState>,
    ClientKey(client_key): ClientKey,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map_or_else(|| format!("req-{}", uuid::Uuid::new_v4()), str::to_string);

    let request = TurnRequest {
        session_id: body.session_id,
        message: body.message,
        client_key,
        correlation_id: correlation_id.clone(),
    };

    let mut response = match state.runtime.handle_turn(request).await {
        Ok(turn) => (StatusCode::OK, Json(turn)).into_response(),
        Err(error) => {
            let code = error.code();
            warn!(
                event_name = "chat.request_failed",
                correlation_id = %correlation_id,
                code = code.as_str(),
                error = %error,
                "chat turn failed"
            );
            error_response(code, error.into_interface(correlation_id.clone()))
        }
    };

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn error_response(code: ErrorCode, error: InterfaceError) -> Response {
    let (status, detail, retry_after_secs) = match &error {
        InterfaceError::TooManyRequests { retry_after_secs, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, None, Some(*retry_after_secs))
        }
        InterfaceError::BadRequest { message, .. } => {
            (StatusCode::BAD_REQUEST, Some(message.clone()), None)
        }
        InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None, None),
        InterfaceError::GatewayTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, None, None),
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
    };

    let body = ChatError {
        code: code.as_str(),
        message: error.user_message(),
        detail,
        correlation_id: error.correlation_id().to_string(),
        retry_after_secs,
    };
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after_secs {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
