use thiserror::Error;

/// Typed failures the store can surface to callers that need to branch
/// on them. Everything else travels as a plain database error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A key with the same (server, email) pair already exists.
    #[error("label already in use on this server")]
    DuplicateLabel,

    /// Conditional debit refused: the balance is below the amount.
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Maps a SQLite unique-constraint violation to `DuplicateLabel`,
    /// leaving every other error untouched.
    pub(crate) fn from_unique_violation(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StoreError::DuplicateLabel;
            }
        }
        StoreError::Database(err)
    }
}
