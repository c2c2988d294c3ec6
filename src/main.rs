mod config;
mod engine;
mod gate;
mod interp;
mod server;
mod skills;

use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::gate::AccessGate;
use crate::server::{McpServer, RenderOptions};
use crate::skills::builtin::ExecuteCodeSkill;
use crate::skills::SkillRegistry;

fn print_help() {
    println!(
        "\
code-gate v{}

An MCP server that exposes a single code-execution tool and denies
every other tool call.

USAGE:
    code-gate [OPTIONS] [COMMAND]

COMMANDS:
    serve           Serve MCP over stdin/stdout [default]
    gate            Read one tool invocation (JSON) from stdin and print
                    the allow/deny decision
    run <FILE|->    Execute a snippet file (or stdin) and print the
                    execution response as JSON

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file
                           [default: built-in defaults]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, code_gate=debug,warn)

EXAMPLES:
    code-gate                                # MCP server, default config
    code-gate -c /etc/code-gate.toml serve   # custom config
    echo '{{\"tool_name\":\"Bash\"}}' | code-gate gate
    code-gate run script.py",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Command {
    Serve,
    Gate,
    Run(String),
}

struct Args {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("code-gate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a path"))?;
                config_path = Some(path);
            }
            "-" => positional.push(arg),
            other if other.starts_with('-') => bail!("Unknown option: {other}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("serve") => Command::Serve,
        Some("gate") => Command::Gate,
        Some("run") => Command::Run(
            positional
                .next()
                .ok_or_else(|| anyhow!("run requires a FILE (or - for stdin)"))?,
        ),
        Some(other) => bail!("Unknown command: {other} (see --help)"),
    };
    if let Some(extra) = positional.next() {
        bail!("Unexpected argument: {extra}");
    }

    Ok(Args {
        config_path,
        command,
    })
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| anyhow!("Cannot read stdin: {e}"))?;
    Ok(input)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    // Logs go to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("code_gate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &args.config_path {
        info!("Loading configuration from {path}");
    }
    let config = Config::load_or_default(args.config_path.as_deref())?;

    match args.command {
        Command::Gate => {
            let gate = AccessGate::new(config.gate.allowed_capability.as_str());
            let decision = gate.decide_envelope(&read_stdin()?);
            println!("{}", serde_json::to_string(&decision)?);
            Ok(())
        }
        Command::Run(source) => {
            let code = if source == "-" {
                read_stdin()?
            } else {
                std::fs::read_to_string(&source)
                    .map_err(|e| anyhow!("Cannot read {source}: {e}"))?
            };
            let engine = ExecutionEngine::new(&config.engine)?;
            let request = ExecutionRequest::new(code);
            let outcome = tokio::task::spawn_blocking(move || engine.execute(&request)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("code-gate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Allowed tool: {}", config.gate.allowed_capability);

    let engine = Arc::new(ExecutionEngine::new(&config.engine)?);
    let mut skills = SkillRegistry::new();
    skills.register(Box::new(ExecuteCodeSkill::new(
        config.gate.allowed_capability.as_str(),
        engine,
        RenderOptions::from_config(&config.server),
    )));
    info!("Skills: {} registered", skills.len());

    let gate = AccessGate::new(config.gate.allowed_capability.as_str());
    let server = McpServer::new(config.server.name.as_str(), gate, skills);

    tokio::select! {
        result = server.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_default_is_serve() {
        let args = parse(&[]).unwrap();
        assert!(matches!(args.command, Command::Serve));
        assert!(args.config_path.is_none());
    }

    #[test]
    fn test_config_and_command() {
        let args = parse(&["-c", "gate.toml", "gate"]).unwrap();
        assert!(matches!(args.command, Command::Gate));
        assert_eq!(args.config_path.as_deref(), Some("gate.toml"));

        let args = parse(&["run", "-", "--config", "x.toml"]).unwrap();
        assert!(matches!(args.command, Command::Run(ref f) if f == "-"));
        assert_eq!(args.config_path.as_deref(), Some("x.toml"));
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse(&["run"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["launch"]).is_err());
        assert!(parse(&["serve", "extra"]).is_err());
    }
}
