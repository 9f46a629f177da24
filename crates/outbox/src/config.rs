//! Queue configuration and well-known store keys.
//!
//! Defaults can be overridden through `OUTBOX_*` environment variables via
//! `QueueConfig::from_env`.

use std::time::Duration;
use std::{env, str::FromStr};

/// Default period of the main-queue drain timer (milliseconds).
const PROCESS_REQUEST_DELAY_MS: u64 = 1_000;
/// Default floor of the first retry wait (milliseconds).
const RETRY_MIN_WAIT_MS: u64 = 10;
/// Default upper bound of the random jitter added to the first retry wait (milliseconds).
const RETRY_JITTER_MS: u64 = 100;
/// Default cap on a single retry wait (milliseconds).
const RETRY_MAX_WAIT_MS: u64 = 10_000;
/// Default number of backoff retries before a request is dropped.
const MAX_REQUEST_RETRIES: u32 = 10;
/// Default interval between leadership claims by followers (milliseconds).
const LEADER_HEARTBEAT_MS: u64 = 1_000;

/// Store keys the queues read or write.
pub mod keys {
    pub const SESSION: &str = "session";
    pub const NETWORK: &str = "network";
    pub const CREDENTIALS: &str = "credentials";
    pub const PREFERRED_THEME: &str = "preferredTheme";
    pub const NVP_PREFERRED_LOCALE: &str = "nvp_preferredLocale";
    pub const NVP_TRY_FOCUS_MODE: &str = "nvp_tryFocusMode";
    pub const IS_LOADING_APP: &str = "isLoadingApp";
    pub const IS_SIDEBAR_LOADED: &str = "isSidebarLoaded";

    /// Keys kept when buffered updates are flushed without an active session.
    pub const PRESERVED: [&str; 7] = [
        NVP_TRY_FOCUS_MODE,
        PREFERRED_THEME,
        NVP_PREFERRED_LOCALE,
        SESSION,
        IS_LOADING_APP,
        CREDENTIALS,
        IS_SIDEBAR_LOADED,
    ];
}

/// Deployment environment; only `Test` skips preserved-key filtering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
    Test,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(anyhow::anyhow!("unknown environment {other:?}")),
        }
    }
}

/// Tuning for the queues, the retry throttle and the leadership heartbeat.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Period of the main-queue drain timer.
    pub process_request_delay: Duration,
    /// Floor of the first retry wait.
    pub retry_min_wait: Duration,
    /// Random jitter added on top of the first retry wait.
    pub retry_jitter: Duration,
    /// Cap on any single retry wait.
    pub retry_max_wait: Duration,
    /// Backoff retries before a request is dropped; 0 retries forever.
    pub max_request_retries: u32,
    /// Interval between leadership claims by followers.
    pub leader_heartbeat: Duration,
    pub environment: Environment,
    /// Keys kept when flushing without an active session.
    pub preserved_keys: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_request_delay: Duration::from_millis(PROCESS_REQUEST_DELAY_MS),
            retry_min_wait: Duration::from_millis(RETRY_MIN_WAIT_MS),
            retry_jitter: Duration::from_millis(RETRY_JITTER_MS),
            retry_max_wait: Duration::from_millis(RETRY_MAX_WAIT_MS),
            max_request_retries: MAX_REQUEST_RETRIES,
            leader_heartbeat: Duration::from_millis(LEADER_HEARTBEAT_MS),
            environment: Environment::Production,
            preserved_keys: keys::PRESERVED.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl QueueConfig {
    /// Defaults with `OUTBOX_*` environment overrides applied.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        cfg.process_request_delay = Duration::from_millis(read_env_u64(
            "OUTBOX_PROCESS_REQUEST_DELAY_MS",
            PROCESS_REQUEST_DELAY_MS,
        ));
        cfg.retry_min_wait =
            Duration::from_millis(read_env_u64("OUTBOX_RETRY_MIN_WAIT_MS", RETRY_MIN_WAIT_MS));
        cfg.retry_jitter =
            Duration::from_millis(read_env_u64("OUTBOX_RETRY_JITTER_MS", RETRY_JITTER_MS));
        cfg.retry_max_wait =
            Duration::from_millis(read_env_u64("OUTBOX_RETRY_MAX_WAIT_MS", RETRY_MAX_WAIT_MS));
        cfg.max_request_retries = read_env_u32("OUTBOX_MAX_REQUEST_RETRIES", MAX_REQUEST_RETRIES);
        cfg.leader_heartbeat =
            Duration::from_millis(read_env_u64("OUTBOX_LEADER_HEARTBEAT_MS", LEADER_HEARTBEAT_MS));
        if let Ok(value) = env::var("OUTBOX_ENV") {
            cfg.environment = value.parse()?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Config for test harnesses: tiny waits, no preserved-key filtering.
    pub fn for_tests() -> Self {
        Self {
            process_request_delay: Duration::from_millis(20),
            retry_min_wait: Duration::from_millis(1),
            retry_jitter: Duration::ZERO,
            retry_max_wait: Duration::from_millis(20),
            leader_heartbeat: Duration::from_millis(20),
            environment: Environment::Test,
            ..Self::default()
        }
    }

    pub fn is_test_env(&self) -> bool {
        self.environment == Environment::Test
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.process_request_delay.is_zero(),
            "process_request_delay must be > 0"
        );
        anyhow::ensure!(
            !self.leader_heartbeat.is_zero(),
            "leader_heartbeat must be > 0"
        );
        anyhow::ensure!(
            self.retry_min_wait <= self.retry_max_wait,
            "retry_min_wait must be <= retry_max_wait"
        );
        Ok(())
    }
}

/// Read an env var as u64 with a default.
fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(v.trim()).ok())
        .unwrap_or(default)
}

/// Read an env var as u32 with a default.
fn read_env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| u32::from_str(v.trim()).ok())
        .unwrap_or(default)
}
