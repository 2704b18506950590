use thiserror::Error;

pub type SharedResult<T> = Result<T, SharedError>;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid UTC offset: {0} hours")]
    InvalidOffset(i8),
}
