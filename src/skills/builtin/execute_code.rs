//! Builtin skill: run a code snippet and report what it produced.
//!
//! The snippet runs in a fresh context on the blocking pool. Its
//! `result` binding, stdout and stderr are rendered as text; large
//! results and large responses are written to files instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::server::render::{self, RenderOptions};
use crate::skills::{Skill, SkillContext};

/// The code-execution tool. Its name is the capability the gate admits,
/// so the advertised tool and the allowed call always agree.
pub struct ExecuteCodeSkill {
    name: String,
    engine: Arc<ExecutionEngine>,
    render: RenderOptions,
}

impl ExecuteCodeSkill {
    pub fn new(name: impl Into<String>, engine: Arc<ExecutionEngine>, render: RenderOptions) -> Self {
        Self {
            name: name.into(),
            engine,
            render,
        }
    }
}

/// Builds the request from tool arguments. `working_dir` and
/// `working_directory` are both accepted.
fn parse_request(params: &Value) -> anyhow::Result<ExecutionRequest> {
    let code = params["code"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: code"))?;

    let mut request = ExecutionRequest::new(code);
    for key in ["working_dir", "working_directory"] {
        match &params[key] {
            Value::Null => {}
            Value::String(dir) => {
                request = request.in_directory(dir.as_str());
                break;
            }
            _ => anyhow::bail!("Parameter {key} must be a string"),
        }
    }
    Ok(request)
}

#[async_trait]
impl Skill for ExecuteCodeSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Execute Python code (a subset: no classes, only the math, sys, json and os \
         modules). Set a 'result' variable to return data. Large results are written \
         to temp files to prevent context overflow."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python code to execute. Set 'result' variable to return data."
                },
                "working_dir": {
                    "type": "string",
                    "description": "Working directory (optional)"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec![format!(
            "filesystem:{}:write",
            self.render.output_dir.display()
        )]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let request = parse_request(&params)?;
        debug!(
            "{} (request {}): {} bytes in {}",
            self.name,
            context.request_id,
            request.code.len(),
            request.working_directory.as_deref().unwrap_or("<default>")
        );

        let engine = self.engine.clone();
        let job = request.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.execute(&job))
            .await
            .map_err(|e| anyhow::anyhow!("Execution task failed: {e}"))?;

        render::render(&request.code, &outcome, &self.render)
    }
}
