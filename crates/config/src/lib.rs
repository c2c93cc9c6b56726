//! Layered configuration for lectern.
//!
//! Values are resolved in order, later layers winning:
//!
//! 1. built-in defaults (SQLite stores under the platform data directory, or
//!    in-memory backends when there is none),
//! 2. an optional configuration file, its format chosen by extension,
//! 3. environment variables prefixed `LECTERN_`, with `__` separating nested
//!    keys (`LECTERN_CACHE__DEFAULT_TTL_SECS=3600`).
//!
//! Backends are always selected explicitly; nothing is inferred from the
//! platform at runtime beyond the default data directory.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use lectern_cache::{PolicyConfig, ResourceCache};
use lectern_catalog::{CatalogManager, DEFAULT_MERGE_THRESHOLD};
use lectern_storage::AdapterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "LECTERN_";
const CACHE_DATABASE: &str = "resource-cache.sqlite";
const CATALOG_DATABASE: &str = "resource-catalog.sqlite";
const CACHE_STORE: &str = "resource_cache";
const CATALOG_STORE: &str = "resource_catalog";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub adapter: AdapterConfig,
    /// Applied by `ResourceCache::set` when the caller passes no TTL.
    pub default_ttl_secs: Option<u64>,
    /// Consulted on every prune and optimize pass.
    pub eviction: Vec<PolicyConfig>,
}
impl Default for CacheSettings {
    fn default() -> Self {
        Self { adapter: AdapterConfig::Memory, default_ttl_secs: None, eviction: vec![PolicyConfig::Ttl { max_age_secs: None }] }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub adapter: AdapterConfig,
    /// Ingredient count above which stored metadata is protected from
    /// sparser updates.
    pub merge_threshold: usize,
}
impl Default for CatalogSettings {
    fn default() -> Self {
        Self { adapter: AdapterConfig::Memory, merge_threshold: DEFAULT_MERGE_THRESHOLD }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSettings,
    pub catalog: CatalogSettings,
}
impl Config {
    /// Defaults rooted at the platform data directory.
    pub fn platform_defaults() -> Self {
        match ProjectDirs::from("org", "lectern", "lectern") {
            Some(dirs) => Self::defaults_in(Some(dirs.data_dir())),
            None => {
                tracing::warn!("no platform data directory, defaulting to in-memory backends");
                Self::defaults_in(None)
            },
        }
    }

    /// One SQLite database per purpose under `data_dir`, or in-memory
    /// backends without one.
    pub fn defaults_in(data_dir: Option<&Path>) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::default();
        };
        Self {
            cache: CacheSettings {
                adapter: AdapterConfig::Sqlite { path: data_dir.join(CACHE_DATABASE), store: CACHE_STORE.to_string() },
                ..CacheSettings::default()
            },
            catalog: CatalogSettings {
                adapter: AdapterConfig::Sqlite {
                    path: data_dir.join(CATALOG_DATABASE),
                    store: CATALOG_STORE.to_string(),
                },
                ..CatalogSettings::default()
            },
        }
    }

    /// Load from the platform defaults, `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_over(Self::platform_defaults(), path)
    }

    /// Load with `defaults` as the bottom layer.
    ///
    /// # Errors
    ///
    /// - [`NotFound`](ErrorKind::NotFound) if `path` is given but missing.
    /// - [`UnsupportedFormat`](ErrorKind::UnsupportedFormat) for an unknown
    ///   file extension.
    /// - [`Extract`](ErrorKind::Extract) if the merged layers don't form a
    ///   valid configuration.
    pub fn load_over(defaults: Self, path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(defaults));
        if let Some(path) = path {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        let config: Self =
            figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().or_raise(|| ErrorKind::Extract)?;
        tracing::debug!(?config, "loaded configuration");
        Ok(config)
    }

    /// Build the content cache described by `cache`.
    pub fn open_cache(&self) -> Result<ResourceCache> {
        let adapter =
            lectern_storage::open_adapter("resource-cache", &self.cache.adapter).or_raise(|| ErrorKind::Backend("cache"))?;
        let mut cache = ResourceCache::new(adapter);
        if let Some(ttl) = self.cache.default_ttl_secs {
            cache = cache.with_default_ttl(Duration::from_secs(ttl));
        }
        Ok(self.cache.eviction.iter().fold(cache, |cache, policy| cache.with_boxed_policy(policy.build())))
    }

    /// Build the catalog described by `catalog`.
    pub fn open_catalog(&self) -> Result<CatalogManager> {
        let adapter = lectern_catalog::open_catalog("resource-catalog", &self.catalog.adapter)
            .or_raise(|| ErrorKind::Backend("catalog"))?;
        Ok(CatalogManager::new(adapter).with_merge_threshold(self.catalog.merge_threshold))
    }
}
