use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Taller live chat server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "taller-chat-server", version, about = "Live chat server for the workshop backend")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "TALLER_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "TALLER_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./taller-chat.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "TALLER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "TALLER_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Redis URL for the cross-instance relay backbone.
    /// Unset = single-instance deployment, relay disabled.
    #[arg(long, env = "TALLER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Identity tag for relay events published by this process.
    /// Auto-generated from hostname when unset.
    #[arg(long, env = "TALLER_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Chat engine tuning (loaded from [chat] section in TOML)
    #[arg(skip)]
    #[serde(default = "default_chat_config")]
    pub chat: Option<ChatConfig>,
}

/// Tuning for the connection registry's idle reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Seconds between idle sweeps (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds of inactivity before a connection is evicted (default: 300)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            connection_timeout_secs: 300,
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    300
}

fn default_chat_config() -> Option<ChatConfig> {
    Some(ChatConfig::default())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./taller-chat.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            redis_url: None,
            instance_id: None,
            chat: Some(ChatConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (TALLER_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("TALLER_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Instance identity for relay event tagging: the configured id, or
    /// hostname plus a random suffix so two processes on one host differ.
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "taller".to_string());
        let suffix = uuid::Uuid::now_v7().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Taller Chat Server Configuration
# Place this file at ./taller-chat.toml or specify with --config <path>
# All settings can be overridden via environment variables (TALLER_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# Redis URL for the cross-instance relay backbone.
# Leave unset for single-instance deployments: chat still works, events
# simply stay local to this process.
# redis_url = "redis://127.0.0.1:6379"

# Identity tag for relay events published by this process.
# Auto-generated from hostname when unset.
# instance_id = "taller-1"

# ---- Chat engine ----
# [chat]

# Seconds between idle-connection sweeps (default: 60)
# sweep_interval_secs = 60

# Seconds of inactivity before a connection is evicted (default: 300)
# connection_timeout_secs = 300
"#
    .to_string()
}
