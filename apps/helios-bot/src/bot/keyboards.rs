use crate::bot::handlers::Callback;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub fn renew_key(client_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "🔄 Renew now",
        Callback::RenewKey(client_id.to_string()).encode(),
    )]])
}

pub fn view_profile() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "👤 My profile",
        Callback::ViewProfile.encode(),
    )]])
}

pub fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "👤 My profile",
        Callback::ViewProfile.encode(),
    )]])
}
