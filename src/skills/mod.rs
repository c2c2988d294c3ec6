pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde::Serialize;

/// Runtime context passed to skill execution.
pub struct SkillContext {
    /// Identifier of the inbound request (the JSON-RPC id), for logs.
    pub request_id: String,
}

/// A tool as advertised in `tools/list`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// A capability the agent can invoke through `tools/call`.
///
/// Skills are only reached after the access gate has admitted the call;
/// a skill never sees a denied invocation.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier used as the MCP tool name.
    /// Must be lowercase alphanumeric + underscores (e.g. "execute_code").
    fn name(&self) -> &str;

    /// Human-readable description shown to the agent so it knows
    /// when to invoke this skill.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    /// Used as the `inputSchema` field of the tool definition.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Capabilities the skill needs from the host, for startup logging.
    /// Examples: "filesystem:/tmp:write"
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill with the given parameters and return a text result.
    /// The returned string is sent back to the agent as tool output.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use registry::SkillRegistry;
