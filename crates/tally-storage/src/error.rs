//! Store error types.

/// Errors produced by the store contracts.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying PostgreSQL failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be decoded into its domain type.
    #[error("corrupt stored value in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    pub fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_names_the_table() {
        let err = StoreError::corrupt("contacts", "gender code 'X'");
        assert_eq!(
            err.to_string(),
            "corrupt stored value in contacts: gender code 'X'"
        );
    }

    #[test]
    fn database_error_wraps() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(err.to_string().starts_with("database error"));
    }
}
