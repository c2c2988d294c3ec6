//! Turns an execution outcome into the text returned to the agent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::ExecutionOutcome;
use crate::interp::lexer::{self, Tok};

const BLUE: &str = "\x1b[34m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

const SPILL_PREFIX: &str = "execute_code_output_";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub highlight: bool,
    /// Responses longer than this (in chars) are spilled to a JSON file
    pub max_response_chars: usize,
    pub output_dir: PathBuf,
}

impl RenderOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            highlight: config.highlight,
            max_response_chars: config.max_response_chars,
            output_dir: config.output_dir(),
        }
    }
}

/// Wraps keywords, strings, numbers and comments in ANSI colors.
///
/// Source that does not lex is returned unchanged.
pub fn highlight(code: &str) -> String {
    let Ok(lexed) = lexer::tokenize(code) else {
        return code.to_string();
    };

    let mut spans: Vec<(usize, usize, &str)> = lexed
        .tokens
        .iter()
        .filter_map(|token| {
            let color = match token.tok {
                Tok::Kw(_) => BLUE,
                Tok::Str(_) | Tok::FStr(_) => GREEN,
                Tok::Int(_) | Tok::Float(_) => CYAN,
                _ => return None,
            };
            Some((token.start, token.end, color))
        })
        .chain(lexed.comments.iter().map(|&(start, end)| (start, end, YELLOW)))
        .filter(|&(start, end, _)| start < end && end <= code.len())
        .collect();
    spans.sort_by_key(|&(start, _, _)| start);

    let mut out = String::with_capacity(code.len() + spans.len() * 10);
    let mut cursor = 0;
    for (start, end, color) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&code[cursor..start]);
        out.push_str(color);
        out.push_str(&code[start..end]);
        out.push_str(RESET);
        cursor = end;
    }
    out.push_str(&code[cursor..]);
    out
}

/// Renders the response for one execution.
///
/// If the full text is longer than `max_response_chars`, everything is
/// written to `execute_code_output_<uuid>.json` and a short summary naming
/// that file is returned instead. When the file cannot be written the
/// full text is returned after all.
pub fn render(code: &str, outcome: &ExecutionOutcome, options: &RenderOptions) -> Result<String> {
    let echo = if options.highlight {
        highlight(code)
    } else {
        code.to_string()
    };

    let full = render_full(&echo, outcome)?;
    if full.chars().count() <= options.max_response_chars {
        return Ok(full);
    }

    match spill(code, outcome, &options.output_dir) {
        Ok(path) => Ok(render_summary(&echo, &path)),
        Err(e) => {
            warn!("Could not spill response, returning it inline: {e}");
            Ok(full)
        }
    }
}

fn render_full(echo: &str, outcome: &ExecutionOutcome) -> Result<String> {
    let mut lines = vec![echo.to_string(), String::new()];

    if outcome.success() {
        lines.push("✓ Execution successful".to_string());
        if let Some(result) = outcome.result() {
            let pretty = serde_json::to_string_pretty(result)
                .map_err(|e| anyhow!("Cannot format result: {e}"))?;
            lines.push(format!("\nResult:\n{pretty}"));
        }
        push_streams(&mut lines, outcome);
        if let Some(path) = outcome.overflow_path() {
            lines.push(format!("\n📁 Large result saved to: {}", path.display()));
        }
    } else {
        lines.push("✗ Execution failed".to_string());
        lines.push(format!(
            "\nError: {}",
            outcome.error_message().unwrap_or("Unknown error")
        ));
        push_streams(&mut lines, outcome);
    }

    Ok(lines.join("\n"))
}

fn push_streams(lines: &mut Vec<String>, outcome: &ExecutionOutcome) {
    if !outcome.stdout().is_empty() {
        lines.push(format!("\nStdout:\n{}", outcome.stdout()));
    }
    if !outcome.stderr().is_empty() {
        lines.push(format!("\nStderr:\n{}", outcome.stderr()));
    }
}

fn spill(code: &str, outcome: &ExecutionOutcome, dir: &Path) -> Result<PathBuf> {
    let data = json!({
        "code": code,
        "result": outcome.result().cloned().unwrap_or(Value::Null),
        "stdout": outcome.stdout(),
        "stderr": outcome.stderr(),
        "success": outcome.success(),
        "error": outcome.error_message(),
    });
    let body =
        serde_json::to_string_pretty(&data).map_err(|e| anyhow!("Cannot format output: {e}"))?;

    let path = dir.join(format!("{SPILL_PREFIX}{}.json", uuid::Uuid::new_v4()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| anyhow!("Cannot create {}: {e}", path.display()))?;
    file.write_all(body.as_bytes())
        .map_err(|e| anyhow!("Cannot write {}: {e}", path.display()))?;

    info!("Response spilled to {}", path.display());
    Ok(path)
}

fn render_summary(echo: &str, path: &Path) -> String {
    let path = path.display();
    [
        echo.to_string(),
        String::new(),
        format!("✓ Output saved to: {path}"),
        "\nThe JSON file contains:".to_string(),
        "  - code: The executed code".to_string(),
        "  - result: The value of the 'result' variable (if set)".to_string(),
        "  - stdout: Standard output from the code".to_string(),
        "  - stderr: Standard error output".to_string(),
        "  - success: Whether execution succeeded".to_string(),
        "  - error: Error message (if any)".to_string(),
        format!("\nTo access this data, read the file: {path}"),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(dir: &Path) -> RenderOptions {
        RenderOptions {
            highlight: false,
            max_response_chars: 1000,
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_highlight_colors_tokens() {
        let out = highlight("if x == 1:\n    y = 'a'  # note\n");
        assert!(out.contains("\x1b[34mif\x1b[0m"));
        assert!(out.contains("\x1b[36m1\x1b[0m"));
        assert!(out.contains("\x1b[32m'a'\x1b[0m"));
        assert!(out.contains("\x1b[33m# note\x1b[0m"));
        // identifiers and operators stay uncolored
        assert!(out.contains(" x == "));
    }

    #[test]
    fn test_highlight_keeps_text_when_colors_stripped() {
        let code = "for i in range(3):\n    print(f\"{i}\", 2.5)  # loop\n";
        let stripped = highlight(code)
            .replace(BLUE, "")
            .replace(GREEN, "")
            .replace(CYAN, "")
            .replace(YELLOW, "")
            .replace(RESET, "");
        assert_eq!(stripped, code);
    }

    #[test]
    fn test_highlight_falls_back_on_lex_error() {
        let code = "x = 'unterminated";
        assert_eq!(highlight(code), code);
    }

    #[test]
    fn test_render_success() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ExecutionOutcome::succeeded(
            Some(json!({"a": 1})),
            "hi\n".to_string(),
            String::new(),
            None,
        );
        let text = render("result = {'a': 1}", &outcome, &plain(dir.path())).unwrap();
        assert_eq!(
            text,
            "result = {'a': 1}\n\n✓ Execution successful\n\nResult:\n{\n  \"a\": 1\n}\n\nStdout:\nhi\n"
        );
    }

    #[test]
    fn test_render_success_without_result() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ExecutionOutcome::succeeded(None, String::new(), String::new(), None);
        let text = render("pass", &outcome, &plain(dir.path())).unwrap();
        assert_eq!(text, "pass\n\n✓ Execution successful");
    }

    #[test]
    fn test_render_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ExecutionOutcome::failed(
            "ZeroDivisionError: division by zero",
            "before\n".to_string(),
            "warn\n".to_string(),
        );
        let text = render("print('before')\n1/0", &outcome, &plain(dir.path())).unwrap();
        assert!(text.contains("✗ Execution failed"));
        assert!(text.contains("\nError: ZeroDivisionError: division by zero"));
        assert!(text.contains("\nStdout:\nbefore\n"));
        assert!(text.contains("\nStderr:\nwarn\n"));
        assert!(!text.contains("Result:"));
    }

    #[test]
    fn test_render_mentions_overflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ExecutionOutcome::succeeded(
            Some(json!("[Result too large (9000 chars), written to /tmp/r.txt]")),
            String::new(),
            String::new(),
            Some(PathBuf::from("/tmp/r.txt")),
        );
        let text = render("result = 'x' * 9000", &outcome, &plain(dir.path())).unwrap();
        assert!(text.ends_with("\n📁 Large result saved to: /tmp/r.txt"));
    }

    #[test]
    fn test_large_response_is_spilled() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = "line\n".repeat(400);
        let outcome = ExecutionOutcome::succeeded(Some(json!(7)), stdout.clone(), String::new(), None);
        let code = "for i in range(400):\n    print('line')\nresult = 7";

        let text = render(code, &outcome, &plain(dir.path())).unwrap();
        assert!(text.starts_with(code));
        assert!(text.contains("✓ Output saved to: "));
        assert!(!text.contains("Stdout:"));

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("execute_code_output_"));
        assert!(name.ends_with(".json"));
        assert!(text.ends_with(&format!("read the file: {}", files[0].display())));

        let saved: Value =
            serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
        assert_eq!(saved["code"], code);
        assert_eq!(saved["result"], 7);
        assert_eq!(saved["stdout"], stdout.as_str());
        assert_eq!(saved["success"], true);
        assert_eq!(saved["error"], Value::Null);
    }

    #[test]
    fn test_threshold_counts_chars() {
        let dir = tempfile::tempdir().unwrap();
        let options = RenderOptions {
            max_response_chars: 40,
            ..plain(dir.path())
        };
        // 34 chars but 46 bytes once the header is added
        let outcome = ExecutionOutcome::succeeded(None, String::new(), String::new(), None);
        let code = "é".repeat(10);
        let text = render(&code, &outcome, &options).unwrap();
        assert!(text.contains("✓ Execution successful"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spill_failure_returns_full_text() {
        let dir = tempfile::tempdir().unwrap();
        let options = RenderOptions {
            max_response_chars: 1,
            ..plain(&dir.path().join("missing"))
        };
        let outcome =
            ExecutionOutcome::succeeded(Some(json!(3)), "out\n".to_string(), String::new(), None);
        let text = render("result = 3", &outcome, &options).unwrap();
        assert_eq!(
            text,
            "result = 3\n\n✓ Execution successful\n\nResult:\n3\n\nStdout:\nout\n"
        );
        assert!(!dir.path().join("missing").exists());
    }
}
