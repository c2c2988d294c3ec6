//! MCP server: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Every `tools/call` goes through the access gate before the registry is
//! consulted, so a denied tool never reaches a skill.

pub mod render;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::gate::{AccessGate, Invocation};
use crate::skills::{SkillContext, SkillRegistry};

pub use render::RenderOptions;

/// Protocol revision answered when the client does not ask for one.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC error codes
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub struct McpServer {
    name: String,
    gate: AccessGate,
    skills: SkillRegistry,
}

impl McpServer {
    pub fn new(name: impl Into<String>, gate: AccessGate, skills: SkillRegistry) -> Self {
        Self {
            name: name.into(),
            gate,
            skills,
        }
    }

    /// Serves until the reader reaches EOF. Requests are handled strictly
    /// one at a time, in arrival order.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(
            "MCP server '{}' ready ({} tool(s), gate allows '{}')",
            self.name,
            self.skills.len(),
            self.gate.allowed()
        );

        let mut lines = reader.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| anyhow!("Cannot read request: {e}"))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let Some(response) = self.handle_message(&line).await else {
                continue;
            };
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer
                .write_all(out.as_bytes())
                .await
                .map_err(|e| anyhow!("Cannot write response: {e}"))?;
            writer.flush().await?;
        }

        info!("Input closed, shutting down");
        Ok(())
    }

    /// Handles one raw message. Returns `None` for notifications.
    pub async fn handle_message(&self, raw: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable message: {e}");
                return Some(error_response(Value::Null, PARSE_ERROR, format!("Parse error: {e}")));
            }
        };

        let Some(object) = message.as_object() else {
            return Some(error_response(
                Value::Null,
                INVALID_REQUEST,
                "Invalid request: expected a JSON object",
            ));
        };

        let id = object.get("id").cloned();
        let method = object.get("method").and_then(Value::as_str);
        let version_ok = object.get("jsonrpc").and_then(Value::as_str) == Some("2.0");

        let Some(id) = id else {
            // Notification: never answered, even when unknown
            debug!("Notification: {}", method.unwrap_or("<none>"));
            return None;
        };

        let Some(method) = method.filter(|_| version_ok) else {
            return Some(error_response(
                id,
                INVALID_REQUEST,
                "Invalid request: missing method or jsonrpc version",
            ));
        };

        let params = object.get("params").cloned().unwrap_or(Value::Null);
        debug!("Request {id}: {method}");

        let outcome = match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.skills.tool_definitions() })),
            "tools/call" => self.call_tool(&id, &params).await,
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        };

        Some(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => error_response(id, code, message),
        })
    }

    fn initialize(&self, params: &Value) -> Value {
        let version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        if let Some(client) = params.pointer("/clientInfo/name").and_then(Value::as_str) {
            info!("Client connected: {client} (protocol {version})");
        }
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": self.name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn call_tool(&self, id: &Value, params: &Value) -> Result<Value, (i64, String)> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err((INVALID_PARAMS, "Invalid params: missing tool name".to_string()));
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err((
                    INVALID_PARAMS,
                    "Invalid params: arguments must be an object".to_string(),
                ))
            }
        };

        let invocation = Invocation {
            capability_identifier: name.to_string(),
            arguments,
        };
        let decision = self.gate.decide_invocation(&invocation);
        if let Some(reason) = decision.reason() {
            return Ok(tool_result(reason, true));
        }

        let Some(skill) = self.skills.get(name) else {
            warn!("Gate allowed '{name}' but no skill is registered for it");
            return Ok(tool_result(&format!("Unknown tool: {name}"), true));
        };

        let context = SkillContext {
            request_id: id.to_string(),
        };
        info!("Calling tool {name} (request {})", context.request_id);
        match skill
            .execute(Value::Object(invocation.arguments), &context)
            .await
        {
            Ok(text) => Ok(tool_result(&text, false)),
            Err(e) => {
                error!("Tool {name} failed: {e}");
                Ok(tool_result(&format!("Error: {e}"), true))
            }
        }
    }
}

fn tool_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}
