use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::telemetry::LogFormat;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub server_args: Vec<String>,
    pub workspace: PathBuf,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "lsp-probe")]
#[command(about = "Start a language server, run the initialize handshake and print its capabilities", long_about = None)]
pub struct Cli {
    /// Language server executable.
    #[arg(default_value = "rust-analyzer")]
    pub server: String,
    /// Arguments passed to the server, after `--`.
    #[arg(last = true)]
    pub server_args: Vec<String>,
    /// Workspace folder announced to the server. Defaults to the current directory.
    #[arg(long, short)]
    pub workspace: Option<PathBuf>,
    /// Tracing filter directives. Falls back to `RUST_LOG`, then `info`.
    #[arg(long)]
    pub log_filter: Option<String>,
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
    /// Seconds to wait for a request before cancelling it.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> anyhow::Result<Config> {
        let workspace = match self.workspace {
            Some(path) => path,
            None => std::env::current_dir().context("failed to read the current directory")?,
        };
        let workspace = std::fs::canonicalize(&workspace)
            .with_context(|| format!("workspace {} does not exist", workspace.display()))?;
        let log_filter = self
            .log_filter
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Config {
            server: self.server,
            server_args: self.server_args,
            workspace,
            log_filter,
            log_format: self.log_format,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}
