use crate::messenger::Messenger;
use crate::texts;
use anyhow::Result;
use helios_db::repositories::{LedgerRepository, ReferralRepository};
use std::sync::Arc;
use tracing::{info, warn};

/// Referrer's cut of every payment the referred user makes.
const BONUS_PERCENT: i64 = 10;

pub struct ReferralService {
    referrals: ReferralRepository,
    ledger: LedgerRepository,
    messenger: Arc<dyn Messenger>,
}

impl ReferralService {
    pub fn new(
        referrals: ReferralRepository,
        ledger: LedgerRepository,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            referrals,
            ledger,
            messenger,
        }
    }

    /// Handles a `/start <referrer>` deep link. Only the first link per
    /// referred user sticks; self-referrals never do.
    pub async fn register(&self, referrer_tg_id: i64, referred_tg_id: i64) -> Result<bool> {
        let recorded = self.referrals.register(referrer_tg_id, referred_tg_id).await?;
        if recorded {
            info!(referrer_tg_id, referred_tg_id, "Referral recorded");
        }
        Ok(recorded)
    }

    /// Credits the referrer's share of a confirmed payment. Bonuses that
    /// round down to zero are skipped.
    pub async fn on_payment(&self, payer_tg_id: i64, amount: i64) -> Result<()> {
        let Some(referrer) = self.referrals.referrer_of(payer_tg_id).await? else {
            return Ok(());
        };
        let bonus = amount * BONUS_PERCENT / 100;
        if bonus == 0 {
            return Ok(());
        }

        self.ledger.credit(referrer, bonus).await?;
        info!(referrer, payer_tg_id, bonus, "Referral bonus credited");

        if let Err(e) = self
            .messenger
            .send(referrer, &texts::referral_bonus(bonus), None)
            .await
        {
            warn!(referrer, "Referral bonus notice failed: {:#}", e);
        }
        Ok(())
    }

    pub async fn count_for(&self, referrer_tg_id: i64) -> Result<i64> {
        self.referrals.count_by_referrer(referrer_tg_id).await
    }
}
