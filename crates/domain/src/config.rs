use std::fmt;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3210")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3210,
            host: d_host(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway (client bridge)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// How long calls to a disconnected client are held waiting for it to
    /// reconnect. `0` disables the grace period.
    #[serde(default = "d_5000")]
    pub grace_period_ms: u64,
    /// Timeout for a call forwarded to a connected client.
    #[serde(default = "d_30000")]
    pub call_timeout_ms: u64,
    /// Inbound frames larger than this are dropped.
    #[serde(default = "d_1mib")]
    pub max_message_bytes: usize,
    #[serde(default = "d_30")]
    pub heartbeat_interval_secs: u64,
    /// Binding name under which client instances are addressed in the mesh.
    #[serde(default = "d_client_binding")]
    pub client_binding: String,
    /// Maximum in-flight calls per client slot.
    #[serde(default = "d_200")]
    pub max_pending: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            call_timeout_ms: 30_000,
            max_message_bytes: d_1mib(),
            heartbeat_interval_secs: 30,
            client_binding: d_client_binding(),
            max_pending: 200,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the token signing secret.
    /// If the env var is unset, client upgrades are refused.
    #[serde(default = "d_secret_env")]
    pub secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: d_secret_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operation chains
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "d_50")]
    pub max_depth: usize,
    #[serde(default = "d_100")]
    pub max_args: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_args: 100,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |field: &str, message: &str| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message: message.into(),
            })
        };

        if self.server.port == 0 {
            error("server.port", "port must be greater than 0");
        }
        if self.server.host.is_empty() {
            error("server.host", "host must not be empty");
        }
        if self.gateway.call_timeout_ms == 0 {
            error("gateway.call_timeout_ms", "call timeout must be greater than 0");
        }
        if self.gateway.max_pending == 0 {
            error("gateway.max_pending", "max_pending must be greater than 0");
        }
        if self.gateway.client_binding.is_empty() {
            error("gateway.client_binding", "client binding must not be empty");
        }
        if self.chain.max_depth == 0 {
            error("chain.max_depth", "max_depth must be greater than 0");
        }

        if self.gateway.grace_period_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "gateway.grace_period_ms".into(),
                message: "grace period disabled; calls to a disconnected client fail immediately".into(),
            });
        }
        if self.gateway.heartbeat_interval_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "gateway.heartbeat_interval_secs".into(),
                message: "heartbeat disabled; half-open connections go unnoticed".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_3210() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_5000() -> u64 {
    5_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_1mib() -> usize {
    1024 * 1024
}
fn d_30() -> u64 {
    30
}
fn d_client_binding() -> String {
    "client".into()
}
fn d_200() -> usize {
    200
}
fn d_secret_env() -> String {
    "MC_TOKEN_SECRET".into()
}
fn d_50() -> usize {
    50
}
fn d_100() -> usize {
    100
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 3210);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.gateway.grace_period_ms, 5_000);
        assert_eq!(cfg.gateway.call_timeout_ms, 30_000);
        assert_eq!(cfg.gateway.client_binding, "client");
        assert_eq!(cfg.auth.secret_env, "MC_TOKEN_SECRET");
        assert_eq!(cfg.chain.max_depth, 50);
        assert_eq!(cfg.chain.max_args, 100);
    }

    #[test]
    fn partial_gateway_section() {
        let toml_str = r#"
            [gateway]
            grace_period_ms = 0
            max_pending = 8
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.gateway.grace_period_ms, 0);
        assert_eq!(cfg.gateway.max_pending, 8);
        assert_eq!(cfg.gateway.heartbeat_interval_secs, 30);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(back.gateway.max_message_bytes, cfg.gateway.max_message_bytes);
        assert_eq!(back.server.port, cfg.server.port);
    }

    #[test]
    fn defaults_validate_clean() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn zero_port_is_an_error_and_zero_grace_a_warning() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        cfg.gateway.grace_period_ms = 0;
        let issues = cfg.validate();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].severity, ConfigSeverity::Error);
        assert_eq!(issues[0].field, "server.port");
        assert_eq!(issues[1].severity, ConfigSeverity::Warning);
        assert!(issues[1].to_string().starts_with("[WARN] gateway.grace_period_ms"));
    }
}
