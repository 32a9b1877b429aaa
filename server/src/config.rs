use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Tempest conversation messaging gateway
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "tempest-chat-server",
    version,
    about = "Tempest conversation messaging gateway"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "TEMPEST_CHAT_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "TEMPEST_CHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./tempest-chat.toml")]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long, env = "TEMPEST_CHAT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "TEMPEST_CHAT_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Messaging limits and keepalive (loaded from [chat] section in TOML).
    /// Not serialized so the CLI layer never masks the TOML section.
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub chat: ChatConfig,
}

/// Tunables for the conversation gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum message length in characters (default: 512)
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Seconds between server pings on an open channel (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Seconds to replenish one REST write token per peer IP (default: 1)
    #[serde(default = "default_rest_replenish")]
    pub rest_replenish_secs: u64,

    /// REST write burst size per peer IP (default: 30)
    #[serde(default = "default_rest_burst")]
    pub rest_burst: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            rest_replenish_secs: default_rest_replenish(),
            rest_burst: default_rest_burst(),
        }
    }
}

fn default_max_message_chars() -> usize {
    512
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_rest_replenish() -> u64 {
    1
}

fn default_rest_burst() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./tempest-chat.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (TEMPEST_CHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        Self::figment(cli).extract()
    }

    fn figment(cli: Config) -> Figment {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("TEMPEST_CHAT_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Tempest Chat Gateway Configuration
# Place this file at ./tempest-chat.toml or specify with --config <path>
# Top-level settings can be overridden via environment variables
# (TEMPEST_CHAT_PORT, ...) or CLI flags (--port, ...).
# [chat] settings can be overridden with TEMPEST_CHAT_CHAT__<KEY>.

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# ---- Conversation channels ----
# [chat]

# Maximum message length in characters
# max_message_chars = 512

# Keepalive: ping every N seconds, close if no pong within M seconds
# ping_interval_secs = 30
# pong_timeout_secs = 10

# REST write rate limit per peer IP: one token every N seconds, burst of M
# rest_replenish_secs = 1
# rest_burst = 30
"#
    .to_string()
}
