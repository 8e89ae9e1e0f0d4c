use tether_protocol::value::MAX_CONTEXT_BYTES;

/// Optional packages loaded on first import when missing.
pub const DEFAULT_AUTO_LOAD: [&str; 9] = [
    "numpy",
    "pandas",
    "scipy",
    "matplotlib",
    "pyarrow",
    "sklearn",
    "statsmodels",
    "sympy",
    "networkx",
];

#[derive(Debug, Clone)]
pub struct PythonHostConfig {
    pub auto_load: Vec<String>,
    pub max_context_bytes: usize,
    pub thread_name: String,
}

impl Default for PythonHostConfig {
    fn default() -> Self {
        Self {
            auto_load: DEFAULT_AUTO_LOAD.iter().map(ToString::to_string).collect(),
            max_context_bytes: MAX_CONTEXT_BYTES,
            thread_name: "tether-host".to_owned(),
        }
    }
}

impl PythonHostConfig {
    /// Defaults overridden by `TETHER_AUTO_LOAD` (comma separated) and
    /// `TETHER_MAX_CONTEXT_BYTES`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let (auto_load, auto_load_source) = match std::env::var("TETHER_AUTO_LOAD") {
            Ok(raw) if raw.trim().is_empty() => (Vec::new(), "env_empty"),
            Ok(raw) => (
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToOwned::to_owned)
                    .collect(),
                "env",
            ),
            Err(_) => (defaults.auto_load, "default"),
        };

        let (max_context_bytes, max_context_bytes_source) =
            std::env::var("TETHER_MAX_CONTEXT_BYTES").map_or(
                (defaults.max_context_bytes, "default"),
                |raw| match raw.parse::<usize>() {
                    Ok(parsed) => (parsed, "env"),
                    Err(err) => {
                        tracing::warn!(
                            %raw,
                            ?err,
                            "Invalid TETHER_MAX_CONTEXT_BYTES; falling back to default"
                        );
                        (defaults.max_context_bytes, "default")
                    }
                },
            );

        tracing::debug!(
            ?auto_load,
            auto_load_source,
            max_context_bytes,
            max_context_bytes_source,
            "Resolved python host config"
        );

        Self {
            auto_load,
            max_context_bytes,
            thread_name: defaults.thread_name,
        }
    }
}
