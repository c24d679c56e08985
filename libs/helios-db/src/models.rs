use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub tg_id: i64,
    pub balance: i64,
    pub trial_used: bool,
    pub created_at: DateTime<Utc>,
}

/// A provisioned VPN credential. `expiry_time` is epoch milliseconds,
/// matching what the panel stores. The notification flags are one-shot
/// per expiry epoch and reset whenever the key is extended.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Key {
    pub client_id: String,
    pub tg_id: i64,
    pub server_id: String,
    pub email: String,
    pub expiry_time: i64,
    pub notified_10h: bool,
    pub notified_24h: bool,
    pub inconsistent: bool,
    pub connection_uri: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_tg_id: i64,
    pub referred_tg_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub tg_id: i64,
    pub amount: i64,
    pub external_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Which one-shot notification flag a registry query filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyThreshold {
    Hours10,
    Hours24,
}

impl NotifyThreshold {
    pub fn column(&self) -> &'static str {
        match self {
            NotifyThreshold::Hours10 => "notified_10h",
            NotifyThreshold::Hours24 => "notified_24h",
        }
    }
}
