//! Worker configuration.
//!
//! Loaded once at startup from environment variables. Queue and database
//! endpoints are required, everything else has a default.

use anyhow::anyhow;

use crate::derive::DerivationConfig;

/// Container holding original uploads. Requests pointing anywhere else
/// are skipped.
pub const SOURCE_BUCKET: &str = "uploads";

/// Cap applied to the primary derivative when configured as 0.
pub const DEFAULT_PRIMARY_CAP: u32 = 640;

#[derive(Clone, Debug)]
pub struct Config {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub derivation: DerivationConfig,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub queue_url: String,
    pub dead_letter_url: String,
    pub wait_time_secs: i32,
    pub max_messages: i32,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub thumbs_bucket: String,
    pub public_base_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let queue_url =
            std::env::var("SQS_QUEUE_URL").map_err(|_| anyhow!("SQS_QUEUE_URL not set"))?;
        let dead_letter_url = std::env::var("SQS_DEAD_LETTER_URL")
            .map_err(|_| anyhow!("SQS_DEAD_LETTER_URL not set"))?;
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL not set"))?;

        Ok(Config {
            queue: QueueConfig {
                queue_url,
                dead_letter_url,
                // SQS long polling allows at most 20 seconds and 10 messages.
                wait_time_secs: env_parse("SQS_WAIT_TIME_SECS", 20).clamp(0, 20),
                max_messages: env_parse("SQS_MAX_MESSAGES", 5).clamp(1, 10),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            storage: StorageConfig {
                region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                thumbs_bucket: std::env::var("THUMBS_BUCKET")
                    .unwrap_or_else(|_| "thumbnails".to_string()),
                public_base_url: std::env::var("THUMBS_PUBLIC_BASE_URL").ok(),
            },
            derivation: DerivationConfig {
                max_primary: env_parse("THUMB_MAX_DIMENSION", DEFAULT_PRIMARY_CAP),
                max_secondary: env_parse("THUMB_2X_MAX_DIMENSION", 0),
                secondary_enabled: env_parse("THUMB_2X_ENABLED", false),
                quality: env_parse("THUMB_QUALITY", 90),
                sharpen_level: env_parse("THUMB_SHARPEN_LEVEL", 2),
            }
            .normalized(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_fallbacks() {
        std::env::remove_var("MEDIAFLOW_TEST_UNSET");
        assert_eq!(env_parse("MEDIAFLOW_TEST_UNSET", 42u32), 42);

        std::env::set_var("MEDIAFLOW_TEST_GARBLED", "not a number");
        assert_eq!(env_parse("MEDIAFLOW_TEST_GARBLED", 7u32), 7);
        std::env::remove_var("MEDIAFLOW_TEST_GARBLED");

        std::env::set_var("MEDIAFLOW_TEST_BOOL", "true");
        assert!(env_parse("MEDIAFLOW_TEST_BOOL", false));
        std::env::remove_var("MEDIAFLOW_TEST_BOOL");
    }
}
