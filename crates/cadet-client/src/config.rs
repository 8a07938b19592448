//! Configuration for connecting to a local CADET service (spec §4.5).
//!
//! This is deliberately small: CADET's own `.conf` parsing is out of
//! scope (spec §1), but the client library still needs to know how to
//! *reach* the service and how to behave while reconnecting to it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Where the local CADET service is listening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceAddress {
    /// A Unix domain socket path (the common case on a single host).
    Unix(PathBuf),
    /// A TCP address, for service links that cross a loopback-only
    /// network namespace.
    Tcp(SocketAddr),
}

impl Default for ServiceAddress {
    fn default() -> Self {
        ServiceAddress::Unix(default_service_path())
    }
}

fn default_service_path() -> PathBuf {
    PathBuf::from("/var/run/gnunet/cadet-service.sock")
}

/// Configuration for a [`crate::Session`] (spec §4.5 `connect(cfg)`).
///
/// Built with a `derive_builder`-style builder, the same split
/// `arti-client`'s `TorClientConfig`/`TorClientConfigBuilder` uses, sized
/// down to the handful of fields this crate's own service link needs.
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SessionConfig {
    /// Where to find the local CADET service.
    #[builder(default)]
    pub service_address: ServiceAddress,

    /// Minimum delay before the first reconnect attempt.
    #[builder(default = "Duration::from_millis(100)")]
    #[serde(with = "humantime_serde")]
    pub reconnect_min: Duration,

    /// Maximum delay between reconnect attempts, once backoff has grown.
    #[builder(default = "Duration::from_secs(30)")]
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,

    /// Default per-channel send buffer handed to newly created channels,
    /// clamped into `[MIN_CHANNEL_BUFFER, MAX_CHANNEL_BUFFER]` by the
    /// channel table itself.
    #[builder(default = "32")]
    pub default_channel_buffer: u32,
}

impl SessionConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(min), Some(max)) = (self.reconnect_min, self.reconnect_max) {
            if min > max {
                return Err("reconnect_min must not exceed reconnect_max".into());
            }
        }
        Ok(())
    }
}

impl SessionConfig {
    /// A builder pre-populated with defaults, the conventional entry
    /// point (mirrors `TorClientConfig::builder()`).
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::builder().build().expect("default config is always valid")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_builds() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.default_channel_buffer, 32);
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let result = SessionConfig::builder()
            .reconnect_min(Duration::from_secs(60))
            .reconnect_max(Duration::from_secs(1))
            .build();
        assert!(result.is_err());
    }
}
