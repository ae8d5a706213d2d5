use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlerError>;

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Block {0} not found")]
    NotFound(u64),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl CrawlerError {
    /// Whether another attempt at the same operation may succeed.
    /// Malformed data and bad configuration never fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlerError::Network(_) | CrawlerError::NotFound(_) | CrawlerError::Storage(_) => true,
            CrawlerError::Config(_) | CrawlerError::MalformedResponse(_) | CrawlerError::Migrate(_) => false,
        }
    }
}
