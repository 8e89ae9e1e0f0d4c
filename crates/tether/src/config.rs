use std::{path::PathBuf, time::Duration};

use serde_json::Value;
use tether_protocol::InitRequest;

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Exposed to guest programs as the `index_config` global.
    pub index_config: Value,
    pub package_cache_dir: Option<PathBuf>,
    /// Default deadline for [`Supervisor::run`](crate::Supervisor::run).
    pub run_timeout: Option<Duration>,
}

impl SupervisorConfig {
    /// Defaults overridden by `TETHER_INDEX_CONFIG` (JSON),
    /// `TETHER_PACKAGE_CACHE_DIR` and `TETHER_RUN_TIMEOUT_MS` (0 disables).
    #[must_use]
    pub fn from_env() -> Self {
        let (index_config, index_config_source) = std::env::var("TETHER_INDEX_CONFIG").map_or(
            (Value::Null, "default"),
            |raw| match serde_json::from_str::<Value>(&raw) {
                Ok(parsed) => (parsed, "env"),
                Err(err) => {
                    tracing::warn!(
                        %raw,
                        ?err,
                        "Invalid TETHER_INDEX_CONFIG; falling back to default"
                    );
                    (Value::Null, "default")
                }
            },
        );

        let (package_cache_dir, package_cache_dir_source) = std::env::var_os(
            "TETHER_PACKAGE_CACHE_DIR",
        )
        .filter(|raw| !raw.is_empty())
        .map_or((None, "default"), |raw| (Some(PathBuf::from(raw)), "env"));

        let (run_timeout, run_timeout_source) = std::env::var("TETHER_RUN_TIMEOUT_MS").map_or(
            (None, "default"),
            |raw| match raw.parse::<u64>() {
                Ok(0) => (None, "env_disabled"),
                Ok(ms) => (Some(Duration::from_millis(ms)), "env"),
                Err(err) => {
                    tracing::warn!(
                        %raw,
                        ?err,
                        "Invalid TETHER_RUN_TIMEOUT_MS; falling back to default"
                    );
                    (None, "default")
                }
            },
        );

        tracing::debug!(
            index_config_source,
            ?package_cache_dir,
            package_cache_dir_source,
            ?run_timeout,
            run_timeout_source,
            "Resolved supervisor config"
        );

        Self {
            index_config,
            package_cache_dir,
            run_timeout,
        }
    }

    pub(crate) fn init_request(&self) -> InitRequest {
        InitRequest {
            index_config: self.index_config.clone(),
            package_cache_dir: self.package_cache_dir.clone(),
        }
    }
}
