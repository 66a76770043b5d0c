use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrmError>;

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("Missing connection property: {0}")]
    MissingProperty(String),

    #[error("Unknown entity class: {0}")]
    UnknownEntity(String),

    #[error("Entity class already registered: {0}")]
    DuplicateEntity(String),

    #[error("Inconsistent inheritance strategy: {0}")]
    InconsistentStrategy(String),

    #[error("No {entity} entry with identifier {id}")]
    EntryNotFound { entity: String, id: String },

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Type check failed for attribute {attribute}: expected {expected}, got {got}")]
    TypeCheckFailed {
        attribute: String,
        expected: String,
        got: String,
    },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(any(feature = "sqlite", feature = "mysql"))]
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let message = db.message();
            if message.contains("UNIQUE constraint")
                || message.contains("Duplicate entry")
                || message.contains("PRIMARY KEY constraint")
            {
                return OrmError::DuplicateEntry(message.to_string());
            }
            if message.contains("FOREIGN KEY constraint")
                || message.contains("NOT NULL constraint")
                || message.contains("CHECK constraint")
                || message.contains("foreign key constraint")
            {
                return OrmError::IntegrityCheckFailed(message.to_string());
            }
        }
        OrmError::Database(err.to_string())
    }
}
