//! Tunables for the transport client and the per-tester session.

use core::time::Duration;

use crate::btp::endpoint::Endpoint;

/// Transport client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a command may wait for its response.
    pub command_timeout: Duration,
    /// How long to wait for the IUT_READY event after connecting.
    pub iut_ready_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            iut_ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Session configuration for one tester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where the IUT's BTP listener is.
    pub endpoint: Endpoint,
    /// Transport client settings.
    pub client: ClientConfig,
    /// Budget for the IUT process to come up.
    pub iut_start_timeout: Duration,
    /// Wait for IUT_READY after every (re)connect.
    pub wait_iut_ready: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            client: ClientConfig::default(),
            iut_start_timeout: Duration::from_secs(60),
            wait_iut_ready: true,
        }
    }
}

impl SessionConfig {
    /// Session defaults for the given endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }
}
