//! Envelope construction and rendering for the tool surface.
//!
//! Domain outcomes — success or typed failure — always render as the
//! shared envelope inside the tool result's text content; transport-level
//! failures (timeouts, serialization bugs) surface as MCP errors instead.

use flow_core::error::OrchestratorError;
use flow_core::protocol::ToolResponse;
use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// Build a success envelope around a serializable payload.
pub fn success_response<T: Serialize>(
    message: &str,
    data: &T,
) -> Result<ToolResponse, OrchestratorError> {
    let value = serde_json::to_value(data)
        .map_err(|e| OrchestratorError::Storage(format!("response serialization failed: {e}")))?;
    Ok(ToolResponse::ok(message, Some(value)))
}

/// Render an envelope as the tool call's content. Domain failures still
/// produce a protocol-level success whose envelope carries
/// `success = false` and the machine-readable code.
pub fn render(response: &ToolResponse) -> CallToolResult {
    let payload = serde_json::to_string_pretty(response)
        .unwrap_or_else(|_| r#"{"success":false,"message":"serialization failure"}"#.to_string());
    CallToolResult::success(vec![Content::text(payload)])
}

/// Shorthand: render an error envelope.
pub fn render_error(error: &OrchestratorError) -> CallToolResult {
    render(&ToolResponse::from_error(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_carries_data() {
        let response = success_response("done", &serde_json::json!({"n": 3})).unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["n"], 3);
    }

    #[test]
    fn error_envelope_carries_code() {
        let response = ToolResponse::from_error(&OrchestratorError::AlreadyTerminal);
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "ALREADY_TERMINAL");
    }
}
