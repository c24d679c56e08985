//! User-facing message templates. Kept in one place so the scheduler
//! and the bot handlers share identical wording.

use chrono::{DateTime, Utc};

pub fn format_expiry(expiry_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(expiry_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn key_expiry_10h(server_name: &str, email: &str, expiry_ms: i64) -> String {
    format!(
        "⚠️ Your key \"{}\" on {} expires within 10 hours, at {} UTC.\n\
         Renew it now to keep the connection alive.",
        email,
        server_name,
        format_expiry(expiry_ms)
    )
}

pub fn key_expiry_24h(
    server_name: &str,
    email: &str,
    hours_left: i64,
    expiry_ms: i64,
    balance: i64,
) -> String {
    format!(
        "⏳ Your key \"{}\" on {} expires in about {} hours ({} UTC).\n\
         Your balance is {}. Renewal costs {} and happens automatically \
         at expiry if the balance covers it.",
        email,
        server_name,
        hours_left,
        format_expiry(expiry_ms),
        balance,
        crate::config::RENEWAL_FEE,
    )
}

pub fn key_renewed(email: &str, expiry_ms: i64, balance: i64) -> String {
    format!(
        "✅ Key \"{}\" renewed for another month, valid until {} UTC.\n\
         Remaining balance: {}.",
        email,
        format_expiry(expiry_ms),
        balance
    )
}

pub fn key_renewal_failed(email: &str) -> String {
    format!(
        "❗️ We could not renew key \"{}\" on the server. Support has been \
         notified; your balance entry is preserved.",
        email
    )
}

pub fn key_deleted(email: &str) -> String {
    format!(
        "🗑 Key \"{}\" expired and was removed because the balance did not \
         cover the renewal fee. Top up and create a new key any time.",
        email
    )
}

pub fn key_deletion_failed(email: &str) -> String {
    format!(
        "❗️ Key \"{}\" expired and was removed from your account, but the \
         server cleanup did not go through. Support has been notified.",
        email
    )
}

pub fn key_created(connection_uri: &str, days_left: i64) -> String {
    format!(
        "🔑 Your key is ready. Time remaining: {} days.\n\n{}",
        days_left, connection_uri
    )
}

pub fn insufficient_balance() -> String {
    format!(
        "❗️ Not enough balance: a new key or renewal costs {}. Top up from \
         your profile and try again.",
        crate::config::RENEWAL_FEE
    )
}

pub fn duplicate_label() -> &'static str {
    "❌ That name is already in use on this server. Please pick another one."
}

pub fn welcome() -> &'static str {
    "👋 Welcome to Helios VPN. Use the buttons below to create a key or \
     open your profile."
}

pub fn profile(balance: i64, key_count: i64, referral_count: i64) -> String {
    format!(
        "👤 Your profile\nBalance: {}\nKeys: {}\nInvited friends: {}",
        balance, key_count, referral_count
    )
}

pub fn payment_received(amount: i64, balance: i64) -> String {
    format!(
        "💳 Payment of {} received. Balance: {}.",
        amount, balance
    )
}

pub fn referral_bonus(amount: i64) -> String {
    format!("🎁 Referral bonus: {} credited to your balance.", amount)
}
