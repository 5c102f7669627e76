use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context as _, Result};

/// Identifier reported to the downstream function when `SOURCE_NAME` is unset
const DEFAULT_SOURCE_NAME: &str = "KEDAConnector";

/// Environment variables every connector requires at startup
const REQUIRED_VARS: &[&str] = &["TOPIC", "HTTP_ENDPOINT", "MAX_RETRIES", "CONTENT_TYPE"];

/// Connector-wide settings shared by every broker driver.
///
/// Parsed once from the environment at startup and immutable afterwards;
/// drivers hold it behind an `Arc`. `response_topic` and `error_topic` are
/// empty strings when the corresponding sink is not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorMetadata {
    pub topic: String,
    pub response_topic: String,
    pub error_topic: String,
    pub http_endpoint: String,
    pub max_retries: u32,
    pub content_type: String,
    pub source_name: String,
}

impl ConnectorMetadata {
    /// Read connector metadata from the process environment.
    ///
    /// Missing or unparseable required variables are a startup error; the
    /// caller is expected to exit nonzero.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_map(&vars)
    }

    /// Construct metadata from an explicit variable map.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).cloned().unwrap_or_default();

        for var in REQUIRED_VARS {
            if get(var).is_empty() {
                bail!("environment variable not found: {var}");
            }
        }

        let max_retries = get("MAX_RETRIES")
            .trim()
            .parse::<u32>()
            .context("failed to parse value from MAX_RETRIES environment variable")?;

        let mut source_name = get("SOURCE_NAME");
        if source_name.is_empty() {
            source_name = DEFAULT_SOURCE_NAME.to_string();
        }

        Ok(ConnectorMetadata {
            topic: get("TOPIC"),
            response_topic: get("RESPONSE_TOPIC"),
            error_topic: get("ERROR_TOPIC"),
            http_endpoint: get("HTTP_ENDPOINT"),
            max_retries,
            content_type: get("CONTENT_TYPE"),
            source_name,
        })
    }

    pub fn has_response_topic(&self) -> bool {
        !self.response_topic.is_empty()
    }

    pub fn has_error_topic(&self) -> bool {
        !self.error_topic.is_empty()
    }
}
