use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
