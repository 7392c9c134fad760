use std::time::Duration;

use async_trait::async_trait;
use kcart_core::domain::tool::ToolName;
use serde_json::{json, Value};
use tracing::debug;

use super::{Tool, ToolContext, ToolError, ToolInput, ToolOutput};

/// HTTP adapter for tools served by another process. Posts
/// `{"input": .., "context": ..}` and expects a JSON object back; an object
/// carrying an `error` key is a tool failure.
#[derive(Clone, Debug)]
pub struct RemoteTool {
    name: ToolName,
    endpoint: String,
    http: reqwest::Client,
}

impl RemoteTool {
    pub fn new(name: ToolName, endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ToolError::execution(error.to_string()))?;
        Ok(Self { name, endpoint: endpoint.into(), http })
    }

    async fn call(&self, input: &ToolInput, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let body = json!({
            "tool": self.name.as_str(),
            "input": input,
            "context": {
                "session_id": context.session_id.as_str(),
                "correlation_id": context.correlation_id,
                "role": context.role.as_str(),
                "account_id": context.identity.as_ref().map(|user| user.account_id.as_str()),
            },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-correlation-id", &context.correlation_id)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    ToolError::timeout(self.name)
                } else {
                    ToolError::execution(format!("{} request failed: {error}", self.name))
                }
            })?;

        let status = response.status();
        let payload = response
            .json::<Value>()
            .await
            .map_err(|error| ToolError::execution(format!("{} returned malformed JSON: {error}", self.name)))?;
        debug!(
            event_name = "tool.remote_response",
            tool = self.name.as_str(),
            status = status.as_u16(),
            "remote tool answered"
        );

        into_output(self.name, status.is_success(), payload)
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> ToolName {
        self.name
    }

    async fn invoke(
        &self,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        tokio::select! {
            _ = context.cancel.cancelled() => {
                Err(ToolError::execution(format!("{} call was cancelled", self.name)))
            }
            result = self.call(input, context) => result,
        }
    }
}

fn into_output(name: ToolName, success: bool, payload: Value) -> Result<ToolOutput, ToolError> {
    match payload {
        Value::Object(map) => {
            if let Some(error) = map.get("error") {
                let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                return Err(ToolError::execution(message));
            }
            if !success {
                return Err(ToolError::execution(format!("{name} returned an error status")));
            }
            Ok(map)
        }
        _ if !success => Err(ToolError::execution(format!("{name} returned an error status"))),
        other => {
            // bare arrays and scalars are wrapped so the output stays a mapping
            let mut map = ToolOutput::new();
            map.insert("result".to_string(), other);
            Ok(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use kcart_core::domain::tool::ToolName;
    use serde_json::json;

    use super::into_output;

    #[test]
    fn error_key_becomes_a_tool_error() {
        let result = into_output(
            ToolName::AnalyticsData,
            true,
            json!({"error": "Product p-9 not found"}),
        );
        let error = result.expect_err("error payload");
        assert_eq!(error.error, "Product p-9 not found");
    }

    #[test]
    fn arrays_are_wrapped_into_a_mapping() {
        let output = into_output(ToolName::VectorSearch, true, json!([{"text": "keep dry"}]))
            .expect("wrapped output");
        assert_eq!(output["result"][0]["text"], "keep dry");
    }

    #[test]
    fn error_status_without_body_fails() {
        let result = into_output(ToolName::DataAccess, false, json!(null));
        assert!(result.is_err());
    }
}
