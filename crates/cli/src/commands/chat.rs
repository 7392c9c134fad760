use std::time::Duration;

use kcart_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use serde_json::{json, Value};

use crate::commands::{local_server_url, CommandResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    message: &'a str,
}

pub fn run(server_url: Option<&str>, session: Option<String>, message: &str) -> CommandResult {
    let base_url = match server_url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => match AppConfig::load(LoadOptions::default()) {
            Ok(config) => local_server_url(&config),
            Err(error) => return CommandResult::failure("chat", "config", error.to_string(), 1),
        },
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                1,
            )
        }
    };

    let url = format!("{base_url}/api/v1/chat");
    let sent = runtime.block_on(send(&url, ChatBody { session_id: session, message }));

    match sent {
        Ok((status, retry_after, body)) => render_response(status, retry_after, &body),
        Err(error) => {
            CommandResult::failure("chat", "connection", format!("failed to reach {url}: {error}"), 2)
        }
    }
}

async fn send(url: &str, body: ChatBody<'_>) -> Result<(u16, Option<u64>, String), reqwest::Error> {
    let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let response = client.post(url).json(&body).send().await?;

    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let text = response.text().await?;
    Ok((status, retry_after, text))
}

/// Maps a chat endpoint response onto the CLI's single-line JSON outcome.
pub fn render_response(status: u16, retry_after: Option<u64>, body: &str) -> CommandResult {
    let payload = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);

    if (200..300).contains(&status) {
        let Some(reply) = field("reply") else {
            return CommandResult::failure("chat", "protocol", "response carried no reply", 1);
        };
        let data = json!({
            "sessionId": payload.get("sessionId"),
            "role": payload.get("role"),
            "authState": payload.get("authState"),
            "tools": payload
                .pointer("/trace/toolCalls")
                .and_then(Value::as_array)
                .map(|calls| calls.iter().filter_map(|call| call.get("toolName")).collect::<Vec<_>>())
                .unwrap_or_default(),
        });
        return CommandResult::success_with("chat", reply, Some(data));
    }

    let message = field("message").unwrap_or_else(|| format!("server answered {status}"));
    let correlation = field("correlationId").map(|id| format!(" (correlation id {id})"));
    let correlation = correlation.unwrap_or_default();

    if status == 429 {
        let wait = retry_after
            .or_else(|| payload.get("retryAfterSecs").and_then(Value::as_u64))
            .map(|secs| format!("; retry after {secs}s"))
            .unwrap_or_default();
        return CommandResult::failure("chat", "rate_limited", format!("{message}{wait}{correlation}"), 1);
    }

    let code = field("code").unwrap_or_else(|| "http_error".to_string());
    let detail = field("detail").map(|detail| format!(": {detail}")).unwrap_or_default();
    CommandResult::failure("chat", &code, format!("{message}{detail}{correlation}"), 1)
}
