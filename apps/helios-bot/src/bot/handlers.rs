use crate::bot::keyboards;
use crate::config::RENEWAL_FEE;
use crate::services::ProvisionError;
use crate::texts;
use crate::AppState;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "start the bot; accepts a referral payload")]
    Start(String),
    #[command(description = "balance, keys and referrals")]
    Profile,
    #[command(description = "create a free one-day trial key: /trial <name>")]
    Trial(String),
    #[command(description = "create a paid key: /newkey <name>")]
    Newkey(String),
    #[command(description = "operator only: message every user")]
    Broadcast(String),
    #[command(description = "list commands")]
    Help,
}

/// Tagged callback payloads. Buttons always go through `encode` so the
/// wire format lives in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    RenewKey(String),
    ViewProfile,
}

impl Callback {
    pub fn encode(&self) -> String {
        match self {
            Callback::RenewKey(client_id) => format!("renew:{}", client_id),
            Callback::ViewProfile => "profile".to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if let Some(client_id) = data.strip_prefix("renew:") {
            if client_id.is_empty() {
                return None;
            }
            return Some(Callback::RenewKey(client_id.to_string()));
        }
        if data == "profile" {
            return Some(Callback::ViewProfile);
        }
        None
    }
}

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let tg_id = msg.chat.id.0;
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Ok(command) = Command::parse(text, "helios") else {
        return Ok(());
    };

    match command {
        Command::Start(payload) => {
            if let Err(e) = state.ledger.ensure_user(tg_id).await {
                error!(tg_id, "User bootstrap failed: {:#}", e);
            }
            if let Ok(referrer) = payload.trim().parse::<i64>() {
                if let Err(e) = state.referrals.register(referrer, tg_id).await {
                    error!(tg_id, "Referral registration failed: {:#}", e);
                }
            }
            bot.send_message(msg.chat.id, texts::welcome())
                .reply_markup(keyboards::main_menu())
                .await?;
        }
        Command::Profile => {
            send_profile(&bot, &state, tg_id).await?;
        }
        Command::Trial(label) => {
            let now = Utc::now().timestamp_millis();
            let reply = match pick_server(&state).await {
                Some(server_id) => {
                    match state
                        .provision
                        .create_trial_key(now, tg_id, &server_id, &label)
                        .await
                    {
                        Ok(key) => {
                            info!(tg_id, client_id = %key.client_id, "Trial key via bot");
                            texts::key_created(&key.connection_uri, 1)
                        }
                        Err(e) => provision_error_text(&e),
                    }
                }
                None => "❌ No servers are available right now.".to_string(),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        Command::Newkey(label) => {
            let now = Utc::now().timestamp_millis();
            let reply = match pick_server(&state).await {
                Some(server_id) => {
                    match state
                        .provision
                        .create_paid_key(now, tg_id, &server_id, &label)
                        .await
                    {
                        Ok(key) => {
                            info!(tg_id, client_id = %key.client_id, "Paid key via bot");
                            texts::key_created(&key.connection_uri, 30)
                        }
                        Err(e) => provision_error_text(&e),
                    }
                }
                None => "❌ No servers are available right now.".to_string(),
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        Command::Broadcast(text) => {
            if tg_id != state.config.admin_chat_id {
                return Ok(());
            }
            let text = text.trim();
            if text.is_empty() {
                bot.send_message(msg.chat.id, "Usage: /broadcast <message>")
                    .await?;
                return Ok(());
            }
            let reply = match state.broadcast.broadcast(text).await {
                Ok(report) => format!(
                    "📣 Broadcast delivered to {} users, {} failed.",
                    report.sent, report.failed
                ),
                Err(e) => {
                    error!("Broadcast failed: {:#}", e);
                    "❗️ Broadcast failed, see the logs.".to_string()
                }
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
    }
    Ok(())
}

pub async fn callback_handler(
    bot: Bot,
    query: CallbackQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let tg_id = query.from.id.0 as i64;
    let callback = query.data.as_deref().and_then(Callback::parse);

    bot.answer_callback_query(query.id.clone()).await?;
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id) else {
        return Ok(());
    };

    match callback {
        Some(Callback::RenewKey(client_id)) => {
            let now = Utc::now().timestamp_millis();
            let reply = match state.provision.renew_key(now, tg_id, &client_id).await {
                Ok(key) => {
                    let balance = state.ledger.get_balance(tg_id).await.unwrap_or(0);
                    texts::key_renewed(&key.email, key.expiry_time, balance)
                }
                Err(e) => provision_error_text(&e),
            };
            bot.send_message(chat_id, reply).await?;
        }
        Some(Callback::ViewProfile) => {
            send_profile(&bot, &state, tg_id).await?;
        }
        None => {
            info!(tg_id, data = ?query.data, "Unknown callback payload ignored");
        }
    }
    Ok(())
}

async fn send_profile(
    bot: &Bot,
    state: &AppState,
    tg_id: i64,
) -> Result<(), teloxide::RequestError> {
    let balance = state.ledger.get_balance(tg_id).await.unwrap_or(0);
    let keys = state.keys.list_by_user(tg_id).await.unwrap_or_default();
    let referral_count = state.referrals.count_for(tg_id).await.unwrap_or(0);

    let mut text = texts::profile(balance, keys.len() as i64, referral_count);
    for key in &keys {
        text.push_str(&format!(
            "\n\n🔑 {} — until {} UTC\n{}",
            key.email,
            texts::format_expiry(key.expiry_time),
            key.connection_uri
        ));
        if let Some(server) = state.config.server(&key.server_id) {
            text.push_str(&format!(
                "\nSubscription: {}",
                crate::panel::subscription_url(server, &key.email)
            ));
        }
    }
    bot.send_message(ChatId(tg_id), text)
        .reply_markup(keyboards::main_menu())
        .await?;
    Ok(())
}

/// Least-filled server takes the next key.
async fn pick_server(state: &AppState) -> Option<String> {
    let fill = state.provision.server_fill().await.ok()?;
    fill.into_iter()
        .min_by_key(|(_, _, pct)| *pct)
        .map(|(id, _, _)| id)
}

fn provision_error_text(error: &ProvisionError) -> String {
    match error {
        ProvisionError::TrialUsed => "❌ You already used your trial key.".to_string(),
        ProvisionError::InsufficientBalance => texts::insufficient_balance(),
        ProvisionError::DuplicateLabel | ProvisionError::Panel(crate::panel::PanelError::DuplicateEmail) => {
            texts::duplicate_label().to_string()
        }
        ProvisionError::InvalidLabel => {
            "❌ Please use letters, digits, '-' or '_' for the key name.".to_string()
        }
        ProvisionError::KeyNotFound => "❌ That key no longer exists.".to_string(),
        other => {
            error!("Provisioning failed: {:#}", other);
            format!(
                "❗️ Something went wrong, nothing was charged beyond the {} fee if it applied. \
                 Please try again later.",
                RENEWAL_FEE
            )
        }
    }
}
