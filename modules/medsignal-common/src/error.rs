use thiserror::Error;

#[derive(Error, Debug)]
pub enum MedSignalError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Scraping error: {0}")]
    Scraping(String),

    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Feedback link expired")]
    LinkExpired,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
