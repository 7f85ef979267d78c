//! Redis streams configuration

use serde::{Deserialize, Serialize};

/// Connection and key-layout settings for [`RedisStreamAdapter`](super::RedisStreamAdapter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStreamConfig {
    /// Redis URL (e.g., "redis://127.0.0.1:6379")
    #[serde(default = "default_url")]
    pub url: String,

    /// Key prefix shared by every stream and delay set
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl RedisStreamConfig {
    /// Config pointing at `url` with the default namespace
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Stream key for a queue: `<namespace>:stream:<queue>`
    pub fn stream_key(&self, queue: &str) -> String {
        format!("{}:stream:{}", self.namespace, queue)
    }

    /// Sorted set holding delayed entries bound for a queue: `<namespace>:delayed:<queue>`
    pub fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.namespace, queue)
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "a3s".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}
