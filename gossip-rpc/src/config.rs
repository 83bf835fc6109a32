//! Gossip configuration.
use std::path::Path;
use std::{fs, io};

use thiserror::Error;

use crate::LocalDuration;

/// Default deadline for the peer's end-of-conversation marker after we asked to finish.
pub const DEFAULT_MAX_SYNC_TIME: LocalDuration = LocalDuration::from_mins(1);
/// Default interval between keep-alive pings.
pub const DEFAULT_PING_PERIOD: LocalDuration = LocalDuration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration from {path}: {err}")]
    Io { path: String, err: io::Error },
    #[error("failed to load configuration from {path}: {err}")]
    Load {
        path: String,
        err: serde_json::Error,
    },
}

/// Gossip protocol configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// How long to wait for the peer's end-of-conversation marker once we asked to finish.
    #[serde(with = "crate::serde_ext::localtime::duration")]
    pub max_sync_time: LocalDuration,
    /// How long the writer waits on an empty outbound queue before considering a ping.
    #[serde(with = "crate::serde_ext::localtime::duration")]
    pub idle_write_poll_timeout: LocalDuration,
    /// How long the dispatcher waits on an empty inbound queue before polling periodic actions.
    #[serde(with = "crate::serde_ext::localtime::duration")]
    pub idle_dispatch_poll_timeout: LocalDuration,
    /// Minimum interval between two pings on one conversation.
    #[serde(with = "crate::serde_ext::localtime::duration")]
    pub ping_period: LocalDuration,
    /// Permit pool size, used when `one_permit_per_peer` is off.
    pub permit_count: usize,
    /// Size the permit pool to the number of peers in the roster.
    pub one_permit_per_peer: bool,
    /// How long the system may be unhealthy before permits are revoked.
    #[serde(with = "crate::serde_ext::localtime::duration")]
    pub unhealthy_grace_period: LocalDuration,
    /// Revocation rate while unhealthy.
    pub permits_revoked_per_second: f64,
    /// Return rate once healthy again.
    pub permits_returned_per_second: f64,
    /// Usable permits restored immediately when the system becomes healthy.
    pub minimum_healthy_unrevoked_permit_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sync_time: DEFAULT_MAX_SYNC_TIME,
            idle_write_poll_timeout: LocalDuration::from_millis(5),
            idle_dispatch_poll_timeout: LocalDuration::from_millis(5),
            ping_period: DEFAULT_PING_PERIOD,
            permit_count: 17,
            one_permit_per_peer: true,
            unhealthy_grace_period: LocalDuration::from_secs(1),
            permits_revoked_per_second: 5.,
            permits_returned_per_second: 1.,
            minimum_healthy_unrevoked_permit_count: 1,
        }
    }
}

impl Config {
    /// Load a configuration from the given JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            err,
        })?;
        let config = serde_json::from_reader(io::BufReader::new(file)).map_err(|err| {
            ConfigError::Load {
                path: path.display().to_string(),
                err,
            }
        })?;

        Ok(config)
    }

    /// Number of permits in the pool for a roster of the given size.
    pub fn permits_for(&self, roster_size: usize) -> usize {
        if self.one_permit_per_peer {
            roster_size.saturating_sub(1)
        } else {
            self.permit_count
        }
    }
}
