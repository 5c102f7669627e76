use std::env;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

const SERVER_VAR: &str = "NATS_SERVER";
const CONSUMER_VAR: &str = "CONSUMER";
const ACK_WAIT_VAR: &str = "ACK_WAIT_SECONDS";
const PULL_BATCH_VAR: &str = "PULL_BATCH";
const CONCURRENT_VAR: &str = "CONCURRENT";
const AUTO_CREATE_VAR: &str = "STREAM_AUTO_CREATE";

const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_PULL_BATCH: usize = 10;
const DEFAULT_CONCURRENT: usize = 1;

/// Broker-specific settings for the JetStream connector.
///
/// The durable name is required so a restarted connector resumes its
/// consumer instead of re-reading the stream from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetStreamSettings {
    pub server: String,
    pub durable: String,
    pub ack_wait: Duration,
    pub pull_batch: usize,
    pub concurrent: usize,
    pub auto_create_streams: bool,
}

impl JetStreamSettings {
    pub fn from_env() -> Result<Self> {
        let server = required(SERVER_VAR)?;
        let durable = required(CONSUMER_VAR)?;
        let ack_wait = match optional(ACK_WAIT_VAR) {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .context("failed to parse value from ACK_WAIT_SECONDS environment variable")?,
            ),
            None => DEFAULT_ACK_WAIT,
        };
        let pull_batch = parse_count(PULL_BATCH_VAR, DEFAULT_PULL_BATCH)?;
        let concurrent = parse_count(CONCURRENT_VAR, DEFAULT_CONCURRENT)?;
        let auto_create_streams = optional(AUTO_CREATE_VAR)
            .map(|raw| raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(JetStreamSettings {
            server,
            durable,
            ack_wait,
            pull_batch,
            concurrent,
            auto_create_streams,
        })
    }
}

fn required(var: &str) -> Result<String> {
    match optional(var) {
        Some(value) => Ok(value),
        None => bail!("environment variable not found: {var}"),
    }
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.is_empty())
}

fn parse_count(var: &str, default: usize) -> Result<usize> {
    match optional(var) {
        Some(raw) => {
            let parsed = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("failed to parse value from {var} environment variable"))?;
            if parsed == 0 {
                bail!("{var} must be at least 1");
            }
            Ok(parsed)
        }
        None => Ok(default),
    }
}
