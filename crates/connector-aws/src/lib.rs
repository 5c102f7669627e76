//! AWS client configuration for the Kinesis and SQS connectors.
//!
//! The region is pinned from the connector environment and, for local
//! broker stacks, an endpoint override. Credentials come from the SDK
//! default provider chain unless both `AWS_ACCESS_KEY` and
//! `AWS_SECRET_KEY` are set, in which case those static credentials are
//! used instead.

use std::env;

use anyhow::{Context as _, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;

const REGION_VAR: &str = "AWS_REGION";
const ENDPOINT_VAR: &str = "AWS_ENDPOINT";
const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY";
const SECRET_KEY_VAR: &str = "AWS_SECRET_KEY";

/// Connection settings read from the connector environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl AwsSettings {
    /// `AWS_REGION` is required; `AWS_ENDPOINT` optionally points every
    /// client at a local stack; `AWS_ACCESS_KEY`/`AWS_SECRET_KEY` override
    /// the default credential chain when both are present.
    pub fn from_env() -> Result<Self> {
        let region = env::var(REGION_VAR)
            .ok()
            .filter(|region| !region.is_empty())
            .context("aws region required")?;
        let endpoint = env::var(ENDPOINT_VAR).ok().filter(|url| !url.is_empty());
        let access_key = env::var(ACCESS_KEY_VAR).ok().filter(|key| !key.is_empty());
        let secret_key = env::var(SECRET_KEY_VAR).ok().filter(|key| !key.is_empty());
        Ok(AwsSettings {
            region,
            endpoint,
            access_key,
            secret_key,
        })
    }

    /// The static credential pair, when both halves were provided.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access_key), Some(secret_key)) => Some((access_key, secret_key)),
            _ => None,
        }
    }

    /// Resolve the full SDK configuration these settings describe.
    pub async fn load(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));
        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((access_key, secret_key)) = self.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ));
        }
        loader.load().await
    }
}
