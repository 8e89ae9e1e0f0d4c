use std::path::PathBuf;

use pyo3::{
    Bound, PyResult, Python, intern,
    types::{PyAnyMethods, PyList, PyListMethods, PyModule},
};
use tracing::{debug, info};

/// Loads allow-listed optional packages on first use.
#[derive(Debug, Clone, Default)]
pub struct PackageLoader {
    allowed: Vec<String>,
    cache_dir: Option<PathBuf>,
}

impl PackageLoader {
    #[must_use]
    pub const fn new(allowed: Vec<String>, cache_dir: Option<PathBuf>) -> Self {
        Self { allowed, cache_dir }
    }

    /// Whether a missing module may be loaded. Submodules resolve to their
    /// top-level package.
    #[must_use]
    pub fn allows(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.allowed.iter().any(|name| name == root)
    }

    /// Make the package cache importable and import `module`.
    ///
    /// # Errors
    /// Returns the import error if the package is still unavailable.
    pub fn load<'py>(&self, py: Python<'py>, module: &str) -> PyResult<Bound<'py, PyModule>> {
        if let Some(dir) = &self.cache_dir {
            let sys = py.import(intern!(py, "sys"))?;
            let path = sys.getattr(intern!(py, "path"))?;
            let path = path.cast_exact::<PyList>()?;
            let dir = dir.to_string_lossy();
            if !path.contains(dir.as_ref())? {
                debug!(dir = %dir, "adding package cache to sys.path");
                path.insert(0, dir.as_ref())?;
            }
        }
        py.import(intern!(py, "importlib"))?
            .call_method0(intern!(py, "invalidate_caches"))?;
        let loaded = py.import(module)?;
        info!(module, "loaded optional package");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submodules_resolve_to_their_package() {
        let loader = PackageLoader::new(vec!["numpy".into(), "sklearn".into()], None);
        assert!(loader.allows("numpy"));
        assert!(loader.allows("sklearn.linear_model"));
        assert!(!loader.allows("numpyx"));
        assert!(!loader.allows("requests"));
    }

    #[test]
    fn cache_dir_becomes_importable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("tether_loader_probe"))?;
        std::fs::write(
            dir.path().join("tether_loader_probe/__init__.py"),
            "ANSWER = 42\n",
        )?;

        let loader = PackageLoader::new(
            vec!["tether_loader_probe".into()],
            Some(dir.path().to_path_buf()),
        );
        Python::initialize();
        Python::attach(|py| -> anyhow::Result<()> {
            let module = loader.load(py, "tether_loader_probe")?;
            let answer: i64 = module.getattr("ANSWER")?.extract()?;
            assert_eq!(answer, 42);
            Ok(())
        })
    }
}
