//! Engine and client manager configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::arena::DEFAULT_MAX_HANDLE;

/// Settings of one request engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads running transfers.
    pub threads: usize,
    /// Completions delivered per `run_frame` call.
    pub frame_budget: usize,
    /// Pooled sessions kept per host, `0` disables pooling.
    pub max_sessions_per_host: usize,
    /// Age after which a pooled session is dropped instead of reused.
    #[serde(with = "duration_secs")]
    pub session_max_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            frame_budget: 10,
            max_sessions_per_host: 4,
            session_max_age: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Same settings with a different thread count.
    #[must_use]
    pub fn with_threads(&self, threads: usize) -> Self {
        Self {
            threads,
            ..self.clone()
        }
    }
}

/// Settings of a client manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Template for every engine. Its thread count is overridden per client.
    pub engine: EngineConfig,
    /// Threads of each of the two main clients.
    pub main_client_threads: usize,
    /// Threads of a client created without an explicit count.
    pub client_threads: usize,
    /// Largest request, options and client handle handed out.
    pub max_handle: u32,
    /// Extra PEM root certificate trusted by the bundled transport.
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            main_client_threads: 6,
            client_threads: 1,
            max_handle: DEFAULT_MAX_HANDLE,
            ca_cert_path: None,
        }
    }
}

/// (De)serializes a [`Duration`] as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes whole seconds.
    pub(super) fn serialize<S: Serializer>(
        value: &Duration, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Reads whole seconds.
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
