use std::path::PathBuf;

/// Configuration for the data layer.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Directory path for the store (default: ./strata)
    pub dir: PathBuf,

    /// Upper bound on store memory, in MiB (default: 1024). Sizes the
    /// embedded store's page cache; the store may refuse writes once the
    /// on-disk footprint grows well past it.
    pub max_size_mb: usize,

    /// Advisory worker count for the upper layers (default: 1). The data
    /// layer itself runs one cleaner thread regardless.
    pub threads: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./strata"),
            max_size_mb: 1024,
            threads: 1,
        }
    }
}

impl DataConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the store memory bound in MiB
    pub fn max_size_mb(mut self, mb: usize) -> Self {
        self.max_size_mb = mb;
        self
    }

    /// Set the advisory worker count
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}
