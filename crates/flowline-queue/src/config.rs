use serde::{Deserialize, Serialize};

/// Connection settings for the Work Queue's Redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub redis_url: String,
}

pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

impl QueueConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
        }
    }

    /// Read from `FLOWLINE_REDIS_URL`, falling back to [`DEFAULT_URL`].
    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("FLOWLINE_REDIS_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        Self { redis_url }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_URL.to_string(),
        }
    }
}
