//! Snippet evaluation.
//!
//! Code runs against an explicit [`EvalContext`] that the caller builds
//! fresh for every request: a [`Namespace`] holding the snippet's
//! top-level bindings, an [`OutputCapture`] receiving everything the
//! snippet prints, and the working directory used to resolve relative
//! paths. Nothing here touches process-wide state (no stdout/stderr
//! redirection, no `chdir`), so two contexts never observe each other.

pub mod ast;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod methods;
pub mod parser;
pub mod value;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use error::{ErrorKind, EvalError};
pub use eval::Interpreter;
pub use value::{ContainerScope, Stream, Value};

/// Top-level bindings of one snippet run.
///
/// Builtins (`print`, `len`, …) are resolved from a static table and are
/// never stored here, so a fresh namespace only contains `__name__`.
#[derive(Debug, Default)]
pub struct Namespace {
    bindings: HashMap<String, Value>,
}

impl Namespace {
    pub fn fresh() -> Self {
        let mut bindings = HashMap::new();
        bindings.insert("__name__".to_string(), Value::from("__main__"));
        Self { bindings }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

/// In-memory stdout/stderr of a snippet.
#[derive(Debug, Default)]
pub struct OutputCapture {
    stdout: String,
    stderr: String,
}

impl OutputCapture {
    pub fn write(&mut self, stream: Stream, text: &str) {
        match stream {
            Stream::Stdout => self.stdout.push_str(text),
            Stream::Stderr => self.stderr.push_str(text),
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Consumes the capture, returning `(stdout, stderr)`.
    pub fn into_parts(self) -> (String, String) {
        (self.stdout, self.stderr)
    }
}

/// Everything a single evaluation may read or write.
///
/// Values created during the run belong to the context: dropping it also
/// frees containers that reference each other.
#[derive(Debug)]
pub struct EvalContext {
    pub namespace: Namespace,
    pub output: OutputCapture,
    working_dir: PathBuf,
    // Last, so the namespace is released before leftover cycles are broken.
    _containers: ContainerScope,
}

impl EvalContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let containers = ContainerScope::enter();
        Self {
            namespace: Namespace::fresh(),
            output: OutputCapture::default(),
            working_dir: working_dir.into(),
            _containers: containers,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Resolves a snippet-supplied path against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }
}

/// A language runtime able to execute snippet source against a context.
///
/// Implementations must keep all state inside `ctx`: the engine relies on
/// dropping the context to discard everything a run produced.
pub trait Evaluator: Send + Sync {
    /// Runs `code` to completion. Output produced before an error stays in
    /// `ctx.output`.
    fn evaluate(&self, code: &str, ctx: &mut EvalContext) -> Result<(), EvalError>;

    /// Human-readable language name, used in logs and tool descriptions.
    fn language(&self) -> &str;
}
