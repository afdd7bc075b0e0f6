use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::metastore::{Durability, FjallMetaStore, MetaStore};
use crate::metrics::SharedMetrics;
use crate::plugins::{FileCache, Gzip, TarDirectory};
use crate::store::{FileStore, StoreOptions, DEFAULT_DB_FILE_PATH_HOLDER, DEFAULT_PARTIAL_SUFFIX};

/// Configuration file structure for filedock.toml
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Directory holding stored content.
    pub storage_root: PathBuf,
    /// Directory of the fjall metadata keyspace.
    pub meta_root: PathBuf,
    /// Enables the cache-aside layer rooted here.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
    #[serde(default = "default_partial_suffix")]
    pub partial_suffix: String,
    #[serde(default = "default_db_file_path_holder")]
    pub db_file_path_holder: String,
    #[serde(default)]
    pub durability: Durability,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub tar_directories: bool,
    #[serde(default)]
    pub remove_partials_on_failure: bool,
}

fn default_partial_suffix() -> String {
    DEFAULT_PARTIAL_SUFFIX.to_string()
}

fn default_db_file_path_holder() -> String {
    DEFAULT_DB_FILE_PATH_HOLDER.to_string()
}

impl Config {
    /// A configuration with defaults for everything but the two roots.
    pub fn new(storage_root: impl Into<PathBuf>, meta_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            meta_root: meta_root.into(),
            cache_root: None,
            partial_suffix: default_partial_suffix(),
            db_file_path_holder: default_db_file_path_holder(),
            durability: Durability::default(),
            gzip: false,
            tar_directories: false,
            remove_partials_on_failure: false,
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.partial_suffix.is_empty() {
            return Err(Error::Config("partial_suffix must not be empty".into()));
        }
        if self.db_file_path_holder.is_empty() {
            return Err(Error::Config("db_file_path_holder must not be empty".into()));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            partial_suffix: self.partial_suffix.clone(),
            db_file_path_holder: self.db_file_path_holder.clone(),
            durability: self.durability,
            remove_partials_on_failure: self.remove_partials_on_failure,
        }
    }
}

impl FileStore {
    /// Opens the fjall metadata store at `meta_root` and builds a store
    /// with the configured plugins.
    pub fn from_config(config: &Config, metrics: SharedMetrics) -> Result<Self> {
        let meta = FjallMetaStore::open(config.meta_root.clone(), Some(config.durability))?;
        Self::from_config_with(config, Arc::new(meta), metrics)
    }

    /// Like [`FileStore::from_config`] over an already opened metadata store.
    ///
    /// Plugins attach in the order tar, gzip, cache, so a directory is packed
    /// before it is compressed, and unpacked after it is decompressed.
    pub fn from_config_with(
        config: &Config,
        meta: Arc<dyn MetaStore>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let mut store = FileStore::new(&config.storage_root, meta)
            .with_options(config.store_options())
            .with_metrics(metrics.clone());

        let hooks = store.hooks_mut();
        if config.tar_directories {
            hooks.register(TarDirectory);
        }
        if config.gzip {
            hooks.register(Gzip::default());
        }
        if let Some(cache_root) = &config.cache_root {
            hooks.register(FileCache::new(cache_root)?.with_metrics(metrics));
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::FileHandle;
    use crate::hooks::HookEvent;
    use crate::metastore::MemoryMetaStore;
    use crate::store::Options;
    use crate::stream::bytes_stream;

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
storage_root = "/srv/filedock/data"
meta_root = "/srv/filedock/meta"
"#;

        let config = Config::parse(toml_content).unwrap();
        assert_eq!(config, Config::new("/srv/filedock/data", "/srv/filedock/meta"));
        assert_eq!(config.partial_suffix, ".part");
        assert_eq!(config.durability, Durability::Fdatasync);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
storage_root = "data"
meta_root = "meta"
cache_root = "cache"
partial_suffix = ".inflight"
db_file_path_holder = ".marker"
durability = "fsync"
gzip = true
tar_directories = true
remove_partials_on_failure = true
"#;

        let config = Config::parse(toml_content).unwrap();
        assert_eq!(config.cache_root, Some(PathBuf::from("cache")));
        assert_eq!(config.durability, Durability::Fsync);

        let options = config.store_options();
        assert_eq!(options.partial_suffix, ".inflight");
        assert_eq!(options.db_file_path_holder, ".marker");
        assert!(options.remove_partials_on_failure);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(Config::parse("storage_root = \"x\""), Err(Error::Config(_))));
        let empty_suffix = "storage_root = \"a\"\nmeta_root = \"b\"\npartial_suffix = \"\"";
        assert!(matches!(Config::parse(empty_suffix), Err(Error::Config(_))));
        assert!(matches!(
            Config::load_from_file("/definitely/not/filedock.toml"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_plugins_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("data"), dir.path().join("meta"));
        let meta = Arc::new(MemoryMetaStore::new());

        let bare =
            FileStore::from_config_with(&config, meta.clone(), SharedMetrics::default()).unwrap();
        assert!(HookEvent::ALL.iter().all(|e| bare.hooks().count(*e) == 0));

        config.gzip = true;
        config.tar_directories = true;
        config.cache_root = Some(dir.path().join("cache"));
        let full = FileStore::from_config_with(&config, meta, SharedMetrics::default()).unwrap();
        assert_eq!(full.hooks().count(HookEvent::StreamWrite), 2);
        assert_eq!(full.hooks().count(HookEvent::StreamRead), 2);
        assert_eq!(full.hooks().count(HookEvent::BeforeRead), 1);
        assert_eq!(full.hooks().count(HookEvent::AfterWrite), 1);
        assert!(dir.path().join("cache").is_dir());
    }

    #[tokio::test]
    async fn test_store_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("filedock.toml");
        let toml_content = format!(
            "storage_root = {:?}\nmeta_root = {:?}\ngzip = true\ndurability = \"buffer\"\n",
            dir.path().join("data"),
            dir.path().join("meta"),
        );
        std::fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        let store = FileStore::from_config(&config, SharedMetrics::default()).unwrap();
        store
            .write(FileHandle::from_stream("cfg", bytes_stream("configured")), Options::new())
            .await
            .unwrap();

        let dest = dir.path().join("out.txt");
        store.read("cfg", &dest, Options::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "configured");
        assert!(dir.path().join("data").join(".filedock").exists());
    }
}
