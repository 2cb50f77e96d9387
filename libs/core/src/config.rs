use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use anyhow::{Context, Result};

use crate::{client::retry::RetryPolicy, store::DEFAULT_MAX_HISTORY};

const DEFAULT_BIND: &str = "0.0.0.0:8095";
const DEFAULT_WELCOME: &str = "Welcome to support! An agent will join shortly.";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub welcome_message: Option<String>,
    pub max_history: usize,
    /// Reported by the availability probe.
    pub available: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests do not have to
    /// touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .context("BIND must be a socket address")?;
        let welcome_message = match lookup("SUPPORT_WELCOME_MESSAGE") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value),
            None => Some(DEFAULT_WELCOME.to_string()),
        };
        let max_history = match lookup("SUPPORT_MAX_HISTORY") {
            Some(value) => value
                .trim()
                .parse::<NonZeroUsize>()
                .context("SUPPORT_MAX_HISTORY must be a positive integer")?
                .get(),
            None => DEFAULT_MAX_HISTORY,
        };
        let available = match lookup("SUPPORT_AVAILABLE") {
            Some(value) => parse_flag(&value).context("SUPPORT_AVAILABLE must be a boolean")?,
            None => true,
        };
        Ok(Self {
            bind,
            welcome_message,
            max_history,
            available,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8095)),
            welcome_message: Some(DEFAULT_WELCOME.to_string()),
            max_history: DEFAULT_MAX_HISTORY,
            available: true,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Timing knobs for a [`ClientSession`](crate::client::ClientSession).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub ack_timeout: Duration,
    /// How long a live session waits for a missing push before polling for it.
    pub gap_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_interval: DEFAULT_POLL_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
