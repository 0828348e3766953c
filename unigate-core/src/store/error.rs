use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Background(String),
}

impl StoreError {
    pub fn channel_not_found(id: i64) -> Self {
        StoreError::NotFound {
            entity: "channel",
            id,
        }
    }

    pub fn token_not_found(id: i64) -> Self {
        StoreError::NotFound { entity: "token", id }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
