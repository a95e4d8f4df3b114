use thiserror::Error;

pub type Result<T> = std::result::Result<T, PageRenderError>;

#[derive(Debug, Error)]
pub enum PageRenderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Render service error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for PageRenderError {
    fn from(err: reqwest::Error) -> Self {
        PageRenderError::Network(err.to_string())
    }
}

impl PageRenderError {
    /// 5xx and transport failures are worth retrying; 4xx is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PageRenderError::Network(_) => true,
            PageRenderError::Api { status, .. } => *status >= 500,
        }
    }
}
