pub mod config;
pub mod token;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mc_domain::config::Config;

/// meshcall — mesh node gateway for external clients.
#[derive(Debug, Parser)]
#[command(name = "meshcall-gateway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Client credential utilities.
    #[command(subcommand)]
    Token(TokenCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    /// Mint a bearer token for a subject.
    Mint {
        /// Subject the token proves; it owns instances named `<subject>.<suffix>`.
        #[arg(long)]
        subject: String,
        /// Lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from `MC_CONFIG` (or `config.toml`).  A missing
/// file yields the defaults.  Returns the config and the path that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("MC_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = load_from(&config_path)?;
    Ok((config, config_path))
}

fn load_from(path: &str) -> anyhow::Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}
