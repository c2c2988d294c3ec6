use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// The only capability the gate lets through
    #[serde(default = "default_allowed_capability")]
    pub allowed_capability: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Results whose text is longer than this many characters are
    /// written to a file instead of being returned inline
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    /// Where oversized results go [default: system temp directory].
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub overflow_dir: Option<PathBuf>,
    #[serde(default = "default_overflow_prefix")]
    pub overflow_prefix: String,
    /// Directory snippets run in when the request names none
    /// [default: the directory the process was started from]
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Name reported in the MCP `initialize` handshake
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Rendered tool responses longer than this are spilled to a JSON file
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
    /// ANSI-highlight the echoed snippet
    #[serde(default = "default_highlight")]
    pub highlight: bool,
    /// Where spilled responses go [default: system temp directory]
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_allowed_capability() -> String {
    "execute_code".to_string()
}

fn default_max_result_chars() -> usize {
    5000
}

fn default_overflow_prefix() -> String {
    "execute_code_result_".to_string()
}

fn default_server_name() -> String {
    "code-gate".to_string()
}

fn default_max_response_chars() -> usize {
    1000
}

fn default_highlight() -> bool {
    true
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_capability: default_allowed_capability(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_result_chars: default_max_result_chars(),
            overflow_dir: None,
            overflow_prefix: default_overflow_prefix(),
            working_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            max_response_chars: default_max_response_chars(),
            highlight: default_highlight(),
            output_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn overflow_dir(&self) -> PathBuf {
        self.overflow_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl ServerConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses a TOML document, expanding `${VAR}` references first.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise falls back to built-in defaults.
    pub fn load_or_default(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gate.allowed_capability.trim().is_empty() {
            anyhow::bail!("gate.allowed_capability must not be empty");
        }
        if self.engine.max_result_chars == 0 {
            anyhow::bail!("engine.max_result_chars must be greater than zero");
        }
        if self.engine.overflow_prefix.contains(std::path::is_separator) {
            anyhow::bail!("engine.overflow_prefix must not contain a path separator");
        }
        if self.server.max_response_chars == 0 {
            anyhow::bail!("server.max_response_chars must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.gate.allowed_capability, "execute_code");
        assert_eq!(config.engine.max_result_chars, 5000);
        assert_eq!(config.engine.overflow_prefix, "execute_code_result_");
        assert!(config.engine.overflow_dir.is_none());
        assert!(config.engine.working_dir.is_none());
        assert_eq!(config.server.name, "code-gate");
        assert_eq!(config.server.max_response_chars, 1000);
        assert!(config.server.highlight);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::parse(
            r#"
[engine]
max_result_chars = 100

[server]
highlight = false
"#,
        )
        .unwrap();
        assert_eq!(config.engine.max_result_chars, 100);
        assert_eq!(config.engine.overflow_prefix, "execute_code_result_");
        assert!(!config.server.highlight);
        assert_eq!(config.server.max_response_chars, 1000);
        assert_eq!(config.gate.allowed_capability, "execute_code");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CODE_GATE_TEST_OVERFLOW", "/var/spill");
        let config = Config::parse(
            r#"
[engine]
overflow_dir = "${CODE_GATE_TEST_OVERFLOW}/results"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.overflow_dir(), PathBuf::from("/var/spill/results"));
    }

    #[test]
    fn test_unset_env_var_is_an_error() {
        let result = Config::parse(
            r#"
[engine]
overflow_dir = "${CODE_GATE_TEST_DEFINITELY_UNSET}"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_allowed_capability() {
        let err = Config::parse("[gate]\nallowed_capability = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("allowed_capability"));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        assert!(Config::parse("[engine]\nmax_result_chars = 0\n").is_err());
        assert!(Config::parse("[server]\nmax_response_chars = 0\n").is_err());
    }

    #[test]
    fn test_rejects_prefix_with_separator() {
        assert!(Config::parse("[engine]\noverflow_prefix = \"../escape_\"\n").is_err());
    }

    #[test]
    fn test_overflow_dir_defaults_to_temp() {
        let config = EngineConfig::default();
        assert_eq!(config.overflow_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code-gate.toml");
        std::fs::write(&path, "[gate]\nallowed_capability = \"run_snippet\"\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.gate.allowed_capability, "run_snippet");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load("/nonexistent/code-gate.toml").is_err());
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = Config::load_or_default(None).unwrap();
        assert_eq!(config.gate.allowed_capability, "execute_code");
    }
}
