//! Execution engine: runs one snippet per request in a fresh context and
//! reports its stdout, stderr and `result` binding.

pub mod overflow;

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::interp::{ErrorKind, EvalContext, EvalError, Evaluator, Interpreter};

pub use overflow::{overflow_notice, OverflowStore};

/// Name of the binding read back after evaluation.
pub const RESULT_SLOT: &str = "result";

/// Stack size of the evaluation thread. Deeply nested snippets recurse
/// through the evaluator, so this is far above the default 2 MiB.
const EVAL_STACK_SIZE: usize = 64 * 1024 * 1024;

/// An admitted request to run a snippet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default, alias = "working_dir", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            working_directory: None,
        }
    }

    pub fn in_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// What a run produced. Built only through [`ExecutionOutcome::succeeded`]
/// and [`ExecutionOutcome::failed`], so `error` is present exactly when
/// `success` is false and a failed outcome never carries a result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    stdout: String,
    stderr: String,
    #[serde(rename = "result_file", skip_serializing_if = "Option::is_none")]
    overflow_path: Option<PathBuf>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(
        result: Option<Value>,
        stdout: String,
        stderr: String,
        overflow_path: Option<PathBuf>,
    ) -> Self {
        Self {
            success: true,
            result,
            stdout,
            stderr,
            overflow_path,
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            result: None,
            stdout,
            stderr,
            overflow_path: None,
            error_message: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn overflow_path(&self) -> Option<&Path> {
        self.overflow_path.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

/// The `result` binding, converted while the context is still alive.
struct ResultSlot {
    text: String,
    json: Value,
}

/// Everything that leaves the evaluation thread.
struct Evaluation {
    stdout: String,
    stderr: String,
    result: Option<ResultSlot>,
    error: Option<EvalError>,
}

/// Runs snippets. Holds only read-only configuration, so one engine can
/// serve any number of requests; nothing from one run is visible to the
/// next.
pub struct ExecutionEngine {
    evaluator: Box<dyn Evaluator>,
    default_dir: PathBuf,
    max_result_chars: usize,
    overflow: OverflowStore,
}

impl ExecutionEngine {
    /// Builds an engine around the builtin interpreter. The default working
    /// directory is fixed here, from config or the current directory.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_evaluator(config, Box::new(Interpreter::default()))
    }

    pub fn with_evaluator(config: &EngineConfig, evaluator: Box<dyn Evaluator>) -> Result<Self> {
        let default_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        info!(
            "Execution engine ready ({}, default dir {}, overflow above {} chars to {})",
            evaluator.language(),
            default_dir.display(),
            config.max_result_chars,
            config.overflow_dir().display()
        );
        Ok(Self {
            evaluator,
            default_dir,
            max_result_chars: config.max_result_chars,
            overflow: OverflowStore::new(config.overflow_dir(), config.overflow_prefix.clone()),
        })
    }

    pub fn language(&self) -> &str {
        self.evaluator.language()
    }

    /// Runs one request to completion. Never panics and never returns an
    /// error: every failure is folded into the outcome.
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let working_dir = match self.resolve_dir(request.working_directory.as_deref()) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Rejected working directory: {e}");
                return ExecutionOutcome::failed(e.to_string(), String::new(), String::new());
            }
        };

        debug!(
            "Executing {} bytes of code in {}",
            request.code.len(),
            working_dir.display()
        );
        let started = Instant::now();
        let evaluation = match self.run_isolated(&request.code, working_dir) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!("Could not start evaluation: {e}");
                return ExecutionOutcome::failed(
                    format!("{}: {e}", ErrorKind::InternalError),
                    String::new(),
                    String::new(),
                );
            }
        };
        let elapsed = started.elapsed();

        let Evaluation {
            stdout,
            stderr,
            result,
            error,
        } = evaluation;

        if let Some(error) = error {
            match error.line {
                Some(line) => info!("Execution failed after {elapsed:?} at line {line}: {error}"),
                None => info!("Execution failed after {elapsed:?}: {error}"),
            }
            return ExecutionOutcome::failed(error.to_string(), stdout, stderr);
        }

        let Some(slot) = result else {
            info!("Execution succeeded after {elapsed:?} (no result)");
            return ExecutionOutcome::succeeded(None, stdout, stderr, None);
        };

        let chars = slot.text.chars().count();
        if chars <= self.max_result_chars {
            info!("Execution succeeded after {elapsed:?}");
            return ExecutionOutcome::succeeded(Some(slot.json), stdout, stderr, None);
        }

        match self.overflow.write(&slot.text) {
            Ok(path) => {
                let notice = overflow_notice(chars, &path);
                ExecutionOutcome::succeeded(Some(Value::String(notice)), stdout, stderr, Some(path))
            }
            Err(e) => {
                warn!("Failed to spill oversized result: {e}");
                ExecutionOutcome::failed(
                    format!("Result too large ({chars} chars) and could not be written: {e}"),
                    stdout,
                    stderr,
                )
            }
        }
    }

    fn resolve_dir(&self, requested: Option<&str>) -> Result<PathBuf> {
        let Some(requested) = requested else {
            return Ok(self.default_dir.clone());
        };
        let candidate = self.default_dir.join(requested);
        let resolved = candidate.canonicalize().map_err(|e| {
            anyhow::anyhow!("Working directory '{requested}' cannot be resolved: {e}")
        })?;
        if !resolved.is_dir() {
            anyhow::bail!("Working directory '{requested}' is not a directory");
        }
        Ok(resolved)
    }

    /// Evaluates on a dedicated, joined thread with a large stack. A panic
    /// inside the evaluator is caught there, so output written before it is
    /// still returned.
    fn run_isolated(&self, code: &str, working_dir: PathBuf) -> Result<Evaluation> {
        std::thread::scope(|scope| {
            let handle = std::thread::Builder::new()
                .name("code-gate-eval".to_string())
                .stack_size(EVAL_STACK_SIZE)
                .spawn_scoped(scope, || self.evaluate(code, working_dir))?;
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("evaluation thread terminated abnormally"))
        })
    }

    fn evaluate(&self, code: &str, working_dir: PathBuf) -> Evaluation {
        let mut ctx = EvalContext::new(working_dir);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.evaluator.evaluate(code, &mut ctx)
        }));
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(EvalError::new(
                ErrorKind::InternalError,
                panic_message(payload.as_ref()),
            )),
        };

        let result = if error.is_none() {
            ctx.namespace.get(RESULT_SLOT).map(|value| ResultSlot {
                text: value.to_str(),
                json: value.to_json(),
            })
        } else {
            None
        };
        let (stdout, stderr) = std::mem::take(&mut ctx.output).into_parts();
        Evaluation {
            stdout,
            stderr,
            result,
            error,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluator panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::interp::{Stream, Value as SnippetValue};

    fn engine_in(dir: &Path) -> ExecutionEngine {
        let config = EngineConfig {
            overflow_dir: Some(dir.to_path_buf()),
            working_dir: Some(dir.to_path_buf()),
            ..EngineConfig::default()
        };
        ExecutionEngine::new(&config).unwrap()
    }

    fn run(engine: &ExecutionEngine, code: &str) -> ExecutionOutcome {
        engine.execute(&ExecutionRequest::new(code))
    }

    #[test]
    fn test_two_plus_two() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "result = 2 + 2");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"success": true, "result": 4, "stdout": "", "stderr": ""})
        );
    }

    #[test]
    fn test_no_result_binding() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "print('hi')\nimport sys\nsys.stderr.write('warn')");
        assert!(outcome.success());
        assert!(outcome.result().is_none());
        assert_eq!(outcome.stdout(), "hi\n");
        assert_eq!(outcome.stderr(), "warn");
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_empty_code_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "");
        assert!(outcome.success());
        assert!(outcome.result().is_none());
        assert_eq!(outcome.stdout(), "");
        assert_eq!(outcome.stderr(), "");
    }

    #[test]
    fn test_result_none_is_reported_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "result = None");
        assert_eq!(outcome.result(), Some(&Value::Null));
    }

    #[test]
    fn test_error_after_print_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(
            &engine_in(dir.path()),
            "print('partial')\nresult = 1\nraise RuntimeError('boom')",
        );
        assert!(!outcome.success());
        assert_eq!(outcome.stdout(), "partial\n");
        assert_eq!(outcome.error_message(), Some("RuntimeError: boom"));
        assert!(outcome.result().is_none());
        assert!(outcome.overflow_path().is_none());
    }

    #[test]
    fn test_syntax_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "if True print(1)");
        assert!(!outcome.success());
        assert!(outcome.error_message().unwrap().starts_with("SyntaxError:"));
    }

    #[test]
    fn test_runs_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let first = run(&engine, "secret = 42\nresult = secret");
        assert_eq!(first.result(), Some(&json!(42)));

        let second = run(&engine, "result = secret");
        assert!(!second.success());
        assert!(second.error_message().unwrap().starts_with("NameError:"));
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let code = "xs = [i * i for i in range(5)]\nprint(xs)\nresult = {'sum': sum(xs)}";
        let a = run(&engine, code);
        let b = run(&engine, code);
        assert_eq!(a, b);
        assert_eq!(a.result(), Some(&json!({"sum": 30})));
    }

    #[test]
    fn test_large_result_overflows_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let outcome = run(&engine, "result = 'x' * 6000");

        assert!(outcome.success());
        let path = outcome.overflow_path().expect("overflow path").to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("execute_code_result_"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x".repeat(6000));

        let notice = outcome.result().unwrap().as_str().unwrap();
        assert_eq!(notice, overflow_notice(6000, &path));
        assert!(notice.starts_with("[Result too large (6000 chars), written to "));
    }

    #[test]
    fn test_overflow_file_holds_text_form() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let outcome = run(&engine, "result = list(range(2000))");
        let path = outcome.overflow_path().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("[0, 1, 2, "));
        assert!(content.ends_with("1998, 1999]"));
    }

    #[test]
    fn test_result_at_threshold_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "result = 'y' * 5000");
        assert!(outcome.overflow_path().is_none());
        assert_eq!(outcome.result().unwrap().as_str().unwrap().len(), 5000);
    }

    #[test]
    fn test_overflow_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            max_result_chars: 10,
            overflow_dir: Some(dir.path().join("does-not-exist")),
            working_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(&config).unwrap();
        let outcome = run(&engine, "print('kept')\nresult = 'z' * 50");
        assert!(!outcome.success());
        assert_eq!(outcome.stdout(), "kept\n");
        assert!(outcome.error_message().unwrap().contains("could not be written"));
    }

    #[test]
    fn test_missing_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let request = ExecutionRequest::new("print('never')").in_directory("/definitely/not/here");
        let outcome = engine.execute(&request);
        assert!(!outcome.success());
        assert!(outcome.error_message().unwrap().contains("/definitely/not/here"));
        assert_eq!(outcome.stdout(), "");
        assert_eq!(outcome.stderr(), "");
    }

    #[test]
    fn test_working_directory_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.txt"), "").unwrap();
        let engine = engine_in(dir.path());
        let outcome = engine.execute(&ExecutionRequest::new("").in_directory("plain.txt"));
        assert!(!outcome.success());
        assert!(outcome.error_message().unwrap().contains("not a directory"));
    }

    #[test]
    fn test_working_directory_applies_to_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("data");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("input.txt"), "from disk").unwrap();

        let engine = engine_in(dir.path());
        let request = ExecutionRequest::new("with open('input.txt') as f:\n    result = f.read()")
            .in_directory(sub.to_str().unwrap());
        let outcome = engine.execute(&request);
        assert_eq!(outcome.result(), Some(&json!("from disk")));
    }

    #[test]
    fn test_deep_recursion_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&engine_in(dir.path()), "def f(n):\n    return f(n + 1)\nf(0)");
        assert!(!outcome.success());
        assert!(outcome.error_message().unwrap().starts_with("RecursionError:"));
    }

    #[test]
    fn test_comparing_self_containing_lists_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(
            &engine_in(dir.path()),
            "a = []\na.append(a)\nb = []\nb.append(b)\nprint(a == a)\nresult = a == b",
        );
        assert!(!outcome.success());
        assert_eq!(outcome.stdout(), "True\n");
        assert_eq!(
            outcome.error_message(),
            Some("RecursionError: maximum recursion depth exceeded in comparison")
        );
    }

    #[test]
    fn test_deeply_nested_result_is_rendered_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        let outcome = run(
            &engine,
            "x = []\nfor i in range(2000000):\n    x = [x]\nresult = 1",
        );
        assert!(outcome.success(), "{:?}", outcome.error_message());
        assert_eq!(outcome.result(), Some(&json!(1)));

        let outcome = run(&engine, "x = []\nfor i in range(5000):\n    x = [x]\nresult = x");
        assert!(outcome.success(), "{:?}", outcome.error_message());
        assert!(outcome.result().is_some());
    }

    struct PanickingEvaluator;

    impl Evaluator for PanickingEvaluator {
        fn evaluate(&self, _code: &str, ctx: &mut EvalContext) -> Result<(), EvalError> {
            ctx.output.write(Stream::Stdout, "before panic\n");
            ctx.namespace.set("result", SnippetValue::Int(1));
            panic!("evaluator bug");
        }

        fn language(&self) -> &str {
            "test"
        }
    }

    #[test]
    fn test_evaluator_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::with_evaluator(&config, Box::new(PanickingEvaluator)).unwrap();
        let outcome = run(&engine, "anything");
        assert!(!outcome.success());
        assert_eq!(outcome.stdout(), "before panic\n");
        assert_eq!(outcome.error_message(), Some("InternalError: evaluator bug"));
        assert!(outcome.result().is_none());
    }

    #[test]
    fn test_request_accepts_working_dir_alias() {
        let request: ExecutionRequest =
            serde_json::from_value(json!({"code": "x = 1", "working_dir": "/tmp"})).unwrap();
        assert_eq!(request.working_directory.as_deref(), Some("/tmp"));

        let request: ExecutionRequest = serde_json::from_value(json!({"code": ""})).unwrap();
        assert!(request.working_directory.is_none());

        assert!(serde_json::from_value::<ExecutionRequest>(json!({})).is_err());
    }

    #[test]
    fn test_failed_outcome_shape() {
        let outcome = ExecutionOutcome::failed("ValueError: bad", "o".into(), "e".into());
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"success": false, "stdout": "o", "stderr": "e", "error": "ValueError: bad"})
        );
    }
}
