use crate::models::Referral;
use anyhow::{Context, Result};
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: SqlitePool,
}

impl ReferralRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a referral once per referred user. Later attempts,
    /// including a different referrer, are silently ignored — the first
    /// link is immutable. Returns whether a row was written.
    pub async fn register(&self, referrer_tg_id: i64, referred_tg_id: i64) -> Result<bool> {
        if referrer_tg_id == referred_tg_id {
            return Ok(false);
        }
        let result = sqlx::query(
            "INSERT INTO referrals (referrer_tg_id, referred_tg_id) VALUES (?, ?)
             ON CONFLICT(referred_tg_id) DO NOTHING",
        )
        .bind(referrer_tg_id)
        .bind(referred_tg_id)
        .execute(&self.pool)
        .await
        .context("Failed to register referral")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn referrer_of(&self, referred_tg_id: i64) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT referrer_tg_id FROM referrals WHERE referred_tg_id = ?")
            .bind(referred_tg_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch referrer")
    }

    pub async fn list_by_referrer(&self, referrer_tg_id: i64) -> Result<Vec<Referral>> {
        sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referrer_tg_id = ? ORDER BY created_at ASC",
        )
        .bind(referrer_tg_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list referrals")
    }

    pub async fn count_by_referrer(&self, referrer_tg_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referrer_tg_id = ?")
            .bind(referrer_tg_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count referrals")
    }
}
