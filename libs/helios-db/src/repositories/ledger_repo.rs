use crate::error::StoreError;
use crate::models::{Payment, User};
use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Per-user balance ledger. Balances are integers in the smallest
/// currency unit and only ever move through `credit` and `debit`.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the user row on first contact; a no-op afterwards.
    pub async fn ensure_user(&self, tg_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO users (tg_id) VALUES (?) ON CONFLICT(tg_id) DO NOTHING")
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to ensure user")?;
        Ok(())
    }

    pub async fn get_user(&self, tg_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE tg_id = ?")
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    /// Unknown users have a balance of 0; this never fails on a
    /// missing row.
    pub async fn get_balance(&self, tg_id: i64) -> Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM users WHERE tg_id = ?")
                .bind(tg_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch balance")?;
        Ok(balance.unwrap_or(0))
    }

    /// Atomic conditional debit: refuses with `InsufficientBalance`
    /// instead of letting the balance go negative.
    pub async fn debit(&self, tg_id: i64, amount: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - ? WHERE tg_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(tg_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InsufficientBalance);
        }
        Ok(())
    }

    /// Credits the balance, creating the user row if the first contact
    /// happens to be a payment.
    pub async fn credit(&self, tg_id: i64, amount: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (tg_id, balance) VALUES (?, ?)
             ON CONFLICT(tg_id) DO UPDATE SET balance = balance + excluded.balance",
        )
        .bind(tg_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .context("Failed to credit balance")?;
        Ok(())
    }

    /// Every known user id, for operator broadcasts.
    pub async fn list_user_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT tg_id FROM users ORDER BY tg_id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")
    }

    pub async fn trial_used(&self, tg_id: i64) -> Result<bool> {
        let used: Option<bool> =
            sqlx::query_scalar("SELECT trial_used FROM users WHERE tg_id = ?")
                .bind(tg_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch trial flag")?;
        Ok(used.unwrap_or(false))
    }

    pub async fn mark_trial_used(&self, tg_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET trial_used = 1 WHERE tg_id = ?")
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark trial used")?;
        Ok(())
    }

    /// True when a payment with this provider id was already recorded,
    /// so webhook retries stay idempotent.
    pub async fn payment_exists(&self, external_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE external_id = ?")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check payment")?;
        Ok(count > 0)
    }

    pub async fn log_payment(
        &self,
        tg_id: i64,
        amount: i64,
        external_id: Option<&str>,
        status: &str,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (tg_id, amount, external_id, status)
             VALUES (?, ?, ?, ?)
             RETURNING *",
        )
        .bind(tg_id)
        .bind(amount)
        .bind(external_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to log payment")
    }

    /// Logs the payment and credits the balance in one transaction. The
    /// payment row is the dedup anchor for webhook retries, so it must
    /// never land without its credit or vice versa.
    pub async fn record_payment(
        &self,
        tg_id: i64,
        amount: i64,
        external_id: Option<&str>,
        status: &str,
    ) -> Result<Payment> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open payment transaction")?;

        let payment = sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (tg_id, amount, external_id, status)
             VALUES (?, ?, ?, ?)
             RETURNING *",
        )
        .bind(tg_id)
        .bind(amount)
        .bind(external_id)
        .bind(status)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to log payment")?;

        sqlx::query(
            "INSERT INTO users (tg_id, balance) VALUES (?, ?)
             ON CONFLICT(tg_id) DO UPDATE SET balance = balance + excluded.balance",
        )
        .bind(tg_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .context("Failed to credit balance")?;

        tx.commit().await.context("Failed to commit payment")?;
        Ok(payment)
    }
}
