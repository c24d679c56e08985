use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Static description of one panel server. Loaded once at startup and
/// read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub api_url: String,
    pub domain: String,
    pub public_key: String,
    pub sni: String,
    pub short_id: String,
    pub prefix: String,
    pub subscription_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub database_url: String,
    /// Operator chat for backups and failure reports.
    pub admin_chat_id: i64,
    pub panel_username: String,
    pub panel_password: String,
    pub backup_dir: PathBuf,
    pub bind_addr: String,
    pub servers: HashMap<String, ServerConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let servers_file =
            env::var("SERVERS_FILE").unwrap_or_else(|_| "servers.yaml".to_string());
        let raw = std::fs::read_to_string(&servers_file)
            .with_context(|| format!("Failed to read servers file {}", servers_file))?;
        let servers: HashMap<String, ServerConfig> =
            serde_yaml::from_str(&raw).context("Failed to parse servers file")?;
        if servers.is_empty() {
            anyhow::bail!("Servers file {} defines no servers", servers_file);
        }

        Ok(Self {
            bot_token: env::var("BOT_TOKEN").context("BOT_TOKEN must be set")?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://helios.db".to_string()),
            admin_chat_id: env::var("ADMIN_CHAT_ID")
                .context("ADMIN_CHAT_ID must be set")?
                .parse()
                .context("ADMIN_CHAT_ID must be a chat id")?,
            panel_username: env::var("PANEL_USERNAME").context("PANEL_USERNAME must be set")?,
            panel_password: env::var("PANEL_PASSWORD").context("PANEL_PASSWORD must be set")?,
            backup_dir: env::var("BACKUP_DIR")
                .unwrap_or_else(|_| "backups".to_string())
                .into(),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            servers,
        })
    }

    pub fn server(&self, server_id: &str) -> Option<&ServerConfig> {
        self.servers.get(server_id)
    }

    pub fn server_name<'a>(&'a self, server_id: &'a str) -> &'a str {
        self.servers
            .get(server_id)
            .map(|s| s.name.as_str())
            .unwrap_or(server_id)
    }
}

/// Fixed billing policy: every paid action costs the same flat fee.
pub const RENEWAL_FEE: i64 = 100;
pub const RENEWAL_DAYS: i64 = 30;
/// Trial keys run for a day, paid keys for a month; both carry a 3 hour
/// grace so a key issued at midnight does not expire mid-evening.
pub const TRIAL_HOURS: i64 = 24 + 3;
pub const PAID_KEY_HOURS: i64 = RENEWAL_DAYS * 24 + 3;
/// Soft capacity used for the per-server fill percentage.
pub const SERVER_CAPACITY: i64 = 60;
