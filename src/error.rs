use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TorqueSlackError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("No webhook URL configured (set webhook_url or pass --webhook-url)")]
    MissingWebhookUrl,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, TorqueSlackError>;
