use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::{ChatLimits, Heartbeat};

/// Concierge live-chat coordination server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "concierge-server",
    version,
    about = "Live-chat coordination server for the hotel admin panel"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CONCIERGE_PORT", default_value = "4100")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CONCIERGE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./concierge.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CONCIERGE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the chat database
    #[arg(long, env = "CONCIERGE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Milliseconds a typing indicator survives without a refresh
    #[arg(long, env = "CONCIERGE_TYPING_TTL_MS", default_value = "1600")]
    pub typing_ttl_ms: u64,

    /// Milliseconds between typing expiry sweeps
    #[arg(long, env = "CONCIERGE_TYPING_SWEEP_INTERVAL_MS", default_value = "500")]
    pub typing_sweep_interval_ms: u64,

    /// Maximum message text length in characters
    #[arg(long, env = "CONCIERGE_MAX_MESSAGE_LENGTH", default_value = "4000")]
    pub max_message_length: usize,

    /// Maximum attachments per message
    #[arg(long, env = "CONCIERGE_MAX_ATTACHMENTS", default_value = "10")]
    pub max_attachments: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "CONCIERGE_PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(long, env = "CONCIERGE_PONG_TIMEOUT_SECS", default_value = "10")]
    pub pong_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let limits = ChatLimits::default();
        Self {
            port: 4100,
            bind_address: "0.0.0.0".to_string(),
            config: "./concierge.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            typing_ttl_ms: 1600,
            typing_sweep_interval_ms: 500,
            max_message_length: limits.max_message_length,
            max_attachments: limits.max_attachments,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CONCIERGE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let matches = Config::command().get_matches();
        let cli = Config::from_arg_matches(&matches).map_err(|e| e.to_string())?;
        Self::layered(Toml::file(&cli.config), &matches)
    }

    /// Merge the layers over `file`. Only flags given on the command line
    /// take part in the CLI layer; clap defaults would otherwise mask the
    /// file and the environment.
    pub fn layered<P: Provider>(file: P, matches: &ArgMatches) -> Result<Self, figment::Error> {
        let cli = Config::from_arg_matches(matches).map_err(|e| e.to_string())?;

        let mut explicit = serde_json::Map::new();
        if let serde_json::Value::Object(fields) = serde_json::to_value(&cli)
            .map_err(|e| e.to_string())?
        {
            for (key, value) in fields {
                if matches.value_source(&key) == Some(ValueSource::CommandLine) {
                    explicit.insert(key, value);
                }
            }
        }

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
            .merge(Env::prefixed("CONCIERGE_"))
            .merge(Serialized::defaults(explicit))
            .extract()
    }

    pub fn limits(&self) -> ChatLimits {
        ChatLimits {
            max_message_length: self.max_message_length,
            max_attachments: self.max_attachments,
        }
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        // A zero period would make tokio::time::interval panic.
        Duration::from_millis(self.typing_sweep_interval_ms.max(1))
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            // Same zero-period guard as the sweep.
            interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            timeout: Duration::from_secs(self.pong_timeout_secs.max(1)),
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Concierge Chat Server Configuration
# Place this file at ./concierge.toml or specify with --config <path>
# All settings can be overridden via environment variables (CONCIERGE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 4100)
# port = 4100

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite chat database
# data_dir = "./data"

# ---- Typing indicators ----

# How long an indicator stays on after the last keystroke signal (ms)
# typing_ttl_ms = 1600

# How often expired indicators are swept and re-broadcast (ms)
# typing_sweep_interval_ms = 500

# ---- Message limits ----

# Maximum text length in characters
# max_message_length = 4000

# Maximum attachments per message
# max_attachments = 10

# ---- Connection health ----

# Seconds between WebSocket pings
# ping_interval_secs = 30

# Seconds without a pong before the connection is dropped
# pong_timeout_secs = 10
"#
    .to_string()
}
