use crate::messenger::Messenger;
use crate::services::ReferralService;
use crate::texts;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use helios_db::repositories::LedgerRepository;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct WebState {
    pub ledger: LedgerRepository,
    pub referrals: Arc<ReferralService>,
    pub messenger: Arc<dyn Messenger>,
}

/// Confirmed payment pushed by the payment provider.
#[derive(Debug, Deserialize)]
pub struct PaymentNotice {
    pub tg_id: i64,
    pub amount: i64,
    #[serde(default)]
    pub external_id: Option<String>,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payment/webhook", post(payment_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Credits the user's balance and pays the referral share. Retries with
/// the same external id are acknowledged without crediting twice.
async fn payment_webhook(
    State(state): State<WebState>,
    Json(notice): Json<PaymentNotice>,
) -> StatusCode {
    if notice.amount <= 0 {
        return StatusCode::BAD_REQUEST;
    }

    if let Some(external_id) = notice.external_id.as_deref() {
        match state.ledger.payment_exists(external_id).await {
            Ok(true) => {
                info!(external_id, "Duplicate payment notice acknowledged");
                return StatusCode::OK;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Payment dedup check failed: {:#}", e);
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }

    // One transaction for the log and the credit: a retry after a
    // failure must find either both or neither.
    if let Err(e) = state
        .ledger
        .record_payment(
            notice.tg_id,
            notice.amount,
            notice.external_id.as_deref(),
            "succeeded",
        )
        .await
    {
        error!(tg_id = notice.tg_id, "Payment recording failed: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    info!(tg_id = notice.tg_id, amount = notice.amount, "Payment credited");

    let balance = state.ledger.get_balance(notice.tg_id).await.unwrap_or(0);
    if let Err(e) = state
        .messenger
        .send(
            notice.tg_id,
            &texts::payment_received(notice.amount, balance),
            None,
        )
        .await
    {
        warn!(tg_id = notice.tg_id, "Payment notice failed: {:#}", e);
    }

    if let Err(e) = state.referrals.on_payment(notice.tg_id, notice.amount).await {
        warn!(tg_id = notice.tg_id, "Referral bonus failed: {:#}", e);
    }

    StatusCode::OK
}
