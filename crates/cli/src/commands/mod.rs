pub mod chat;
pub mod config;
pub mod doctor;

use kcart_core::config::AppConfig;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// `http://host:port` for the configured listener; wildcard binds are
/// reached over loopback.
pub fn local_server_url(config: &AppConfig) -> String {
    let host = match config.server.bind_address.as_str() {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    };
    format!("http://{host}:{}", config.server.port)
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

#[cfg(test)]
mod tests {
    use kcart_core::config::AppConfig;
    use serde_json::{json, Value};

    use super::{local_server_url, CommandResult};

    #[test]
    fn wildcard_bind_is_reached_over_loopback() {
        let mut config = AppConfig::default();
        config.server.bind_address = "0.0.0.0".to_string();
        config.server.port = 9100;
        assert_eq!(local_server_url(&config), "http://127.0.0.1:9100");
    }

    #[test]
    fn results_serialize_as_single_line_json() {
        let result = CommandResult::success_with("chat", "hi", Some(json!({"sessionId": "s-1"})));
        let payload: Value = serde_json::from_str(&result.output).expect("json output");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"]["sessionId"], "s-1");

        let failure = CommandResult::failure("chat", "connection", "refused", 2);
        assert_eq!(failure.exit_code, 2);
        assert!(!failure.output.contains("\"data\""));
    }
}
