use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use kcart_agent::AgentRuntime;
use kcart_core::domain::tool::ToolName;
use kcart_core::flows::FlashSaleBook;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    runtime: Arc<AgentRuntime>,
    flash_sales: Arc<FlashSaleBook>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub tools: HealthCheck,
    pub registered_tools: Vec<&'static str>,
    pub active_sessions: usize,
    pub rate_limit_keys: usize,
    pub flash_sale_proposals: usize,
    pub checked_at: String,
}

pub fn router(runtime: Arc<AgentRuntime>, flash_sales: Arc<FlashSaleBook>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { runtime, flash_sales })
}

/// Always 200 while the process serves: missing tools degrade answers, they
/// do not stop turns.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let registered = state.runtime.tool_names();
    let missing = ToolName::ALL
        .iter()
        .filter(|tool| !registered.contains(*tool))
        .map(ToolName::as_str)
        .collect::<Vec<_>>();

    let tools = if missing.is_empty() {
        HealthCheck { status: "ready", detail: "all tools registered".to_string() }
    } else {
        HealthCheck {
            status: "degraded",
            detail: format!("not configured: {}", missing.join(", ")),
        }
    };

    let payload = HealthResponse {
        status: tools.status,
        service: HealthCheck {
            status: "ready",
            detail: "kcart-server runtime initialized".to_string(),
        },
        tools,
        registered_tools: registered.iter().map(ToolName::as_str).collect(),
        active_sessions: state.runtime.sessions().len(),
        rate_limit_keys: state.runtime.limiter().tracked_keys(),
        flash_sale_proposals: state.flash_sales.len(),
        checked_at: Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(payload))
}
