#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("column encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("conversation '{conversation_id}' was recently deleted while blocked")]
    RecentlyDeleted { conversation_id: String },
}
