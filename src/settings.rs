//! Environment-driven configuration.
//!
//! Values are read once at startup (after `dotenvy` has loaded any `.env`
//! file) and passed down explicitly; nothing here is consulted again later.

use std::env;

use crate::error::CollectorError;

const DEFAULT_BASE_URL: &str = "https://beam-api.spaceinvader.com";
const DEFAULT_HAYSTACKS_ENDPOINT: &str = "/haystacks";
const DEFAULT_CREDENTIALS_BASE_URL: &str =
    "https://ghfbaqjy00.execute-api.eu-central-1.amazonaws.com/prod/credentials";
const DEFAULT_CREDENTIALS_CLIENT: &str = "space-invader-mac";
const DEFAULT_DEVICE_BATCH_SIZE: u32 = 2500;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Device + ingestion service base URL.
    pub base_url: String,
    /// `x-api-key` for the device and ingestion endpoints.
    pub api_key: String,
    /// Path component of the haystacks endpoints.
    pub haystacks_endpoint: String,
    /// Appended to the Apple User-Agent when a minted blob is uploaded.
    pub user_agent_comment: String,
    /// Default catalog page size when the CLI does not override it.
    pub device_batch_size: u32,
    /// `x-api-key` for the credential store.
    pub credentials_api_key: String,
    /// Credential store base URL.
    pub credentials_base_url: String,
    /// Credential-store key the fleet shares.
    pub default_client: String,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn require(name: &str) -> Result<String, CollectorError> {
    env::var(name).map_err(|_| CollectorError::Config(format!("{name} is not set")))
}

impl Settings {
    pub fn from_env() -> Result<Self, CollectorError> {
        let device_batch_size = match env::var("DEVICE_BATCH_SIZE") {
            Ok(raw) => raw
                .parse::<u32>()
                .map_err(|_| CollectorError::Config(format!("DEVICE_BATCH_SIZE is not an integer: {raw}")))?,
            Err(_) => DEFAULT_DEVICE_BATCH_SIZE,
        };
        Ok(Self {
            base_url: env_or("BASE_URL", DEFAULT_BASE_URL),
            api_key: require("API_KEY")?,
            haystacks_endpoint: env_or("HAYSTACKS_ENDPOINT", DEFAULT_HAYSTACKS_ENDPOINT),
            user_agent_comment: env_or("USER_AGENT_COMMENT", ""),
            device_batch_size,
            credentials_api_key: require("CREDENTIALS_API_KEY")?,
            credentials_base_url: env_or("CREDENTIALS_BASE_URL", DEFAULT_CREDENTIALS_BASE_URL),
            default_client: env_or("DEFAULT_CLIENT_MANAGING_CREDENTIALS", DEFAULT_CREDENTIALS_CLIENT),
        })
    }

    /// Full device/ingestion URL with exactly one slash at the join.
    pub fn haystacks_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.haystacks_endpoint.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        base_url: "https://beam.example.com".to_string(),
        api_key: "test-api-key".to_string(),
        haystacks_endpoint: "/haystacks".to_string(),
        user_agent_comment: String::new(),
        device_batch_size: 2500,
        credentials_api_key: "test-credentials-key".to_string(),
        credentials_base_url: "https://store.example.com/credentials".to_string(),
        default_client: "space-invader-mac".to_string(),
    }
}
