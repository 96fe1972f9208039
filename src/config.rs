//! Centralized configuration for Baobun.
//!
//! All tunable parameters live here to avoid hard-coded values scattered
//! throughout the codebase. Unit and leaf geometry are protocol constants,
//! not configuration.

use std::time::Duration;

/// Central configuration for all engine components.
#[derive(Debug, Clone, Default)]
pub struct BaobunConfig {
    /// Session and tracker knobs
    pub network: NetworkConfig,
    /// Transfer scheduler knobs
    pub scheduler: SchedulerConfig,
}

/// Session-layer and tracker communication configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Time allowed for the overlay to establish a connection
    pub dial_timeout: Duration,
    /// Time allowed for the remote's handshake to arrive
    pub handshake_timeout: Duration,
    /// Interval between tracker reannounce sweeps
    pub reannounce_interval: Duration,
    /// Window over which bandwidth rates are sampled
    pub bandwidth_window: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reannounce_interval: Duration::from_secs(10),
            bandwidth_window: Duration::from_secs(5),
        }
    }
}

/// Transfer scheduler admission and retry configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently outstanding unit requests
    pub max_active_requests: usize,
    /// Upper bound on outstanding requests to any single peer
    pub max_requests_per_peer: usize,
    /// How long a request may stay unanswered before it is retried
    pub request_timeout: Duration,
    /// Cadence of the timeout-and-schedule sweep
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_requests: 64,
            max_requests_per_peer: 8,
            request_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl BaobunConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("BAOBUN_DIAL_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.dial_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("BAOBUN_HANDSHAKE_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.handshake_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("BAOBUN_REQUEST_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.scheduler.request_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max) = std::env::var("BAOBUN_MAX_ACTIVE_REQUESTS") {
            if let Ok(count) = max.parse::<usize>() {
                config.scheduler.max_active_requests = count;
            }
        }

        config
    }

    /// Creates a configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig {
                dial_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                reannounce_interval: Duration::from_millis(200),
                bandwidth_window: Duration::from_secs(5),
            },
            scheduler: SchedulerConfig {
                request_timeout: Duration::from_secs(5),
                tick_interval: Duration::from_millis(50),
                ..Default::default()
            },
        }
    }
}
