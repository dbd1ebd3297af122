//! Lightweight configuration loader and path helpers.
//!
//! Uses Figment to merge serialized defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (nested keys separated by `__`, e.g.
//! `APP_RETRIEVAL__TOKEN_BUDGET=1500`). Provides helpers to expand `~` and
//! `${VAR}` and to resolve relative paths against a known base directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::from_figment(Self::base_figment(&env_name), &env_name)
    }

    /// Layer order: defaults, `config.toml`, env-specific file, `APP_*` variables.
    pub fn base_figment(env_name: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn from_figment(figment: Figment, env_name: &str) -> anyhow::Result<Self> {
        let config = Self { figment };
        config.validate_for_env(env_name)?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// The fully typed settings tree.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to extract settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        match env {
            "prod" | "production" => {
                let backend: String = self.get("embedding.backend")?;
                if backend == "hash" {
                    return Err(anyhow::anyhow!("Prod config must not use the hash embedding backend"));
                }
            }
            "dev" | "development" | "test" | "testing" => {}
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub data: DataSettings,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingSettings,
    pub cache: CacheSettings,
    pub index: IndexSettings,
    pub retrieval: RetrievalSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        self.chunking.validate()?;
        if self.embedding.dim == 0 {
            return Err(Error::InvalidConfig("embedding.dim must be > 0".into()));
        }
        if self.embedding.max_batch == 0 || self.embedding.workers == 0 || self.embedding.queue_depth == 0 {
            return Err(Error::InvalidConfig("embedding.max_batch, workers and queue_depth must be > 0".into()));
        }
        if self.cache.capacity == Some(0) {
            return Err(Error::InvalidConfig("cache.capacity must be > 0 when set".into()));
        }
        if !(0.0..=1.0).contains(&self.index.compact_ratio) {
            return Err(Error::InvalidConfig("index.compact_ratio must be within [0, 1]".into()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(Error::InvalidConfig("retrieval.similarity_threshold must be within [-1, 1]".into()));
        }
        if self.retrieval.index_batch == 0 || self.retrieval.query_memo == 0 {
            return Err(Error::InvalidConfig("retrieval.index_batch and query_memo must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataSettings {
    /// Root of `<platform>/<game>/guide_*.md`.
    pub guides_dir: String,
    /// LanceDB directory holding the cache, index and meta tables.
    pub db_dir: String,
}

impl Default for DataSettings {
    fn default() -> Self { Self { guides_dir: "guides".into(), db_dir: "data/guidedb".into() } }
}

impl DataSettings {
    pub fn guides_path(&self, base: &Path) -> PathBuf { resolve_with_base(base, &self.guides_dir) }

    pub fn db_path(&self, base: &Path) -> PathBuf { resolve_with_base(base, &self.db_dir) }
}

/// Window sizes for [`crate::chunker::chunk`], in whitespace tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// How far a cut may move back to land on a paragraph or sentence boundary.
    pub snap_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self { Self { chunk_size: 200, chunk_overlap: 20, snap_window: 10 } }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunking.chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.snap_window >= self.chunk_size - self.chunk_overlap {
            return Err(Error::InvalidConfig("chunking.snap_window must be smaller than chunk_size - chunk_overlap".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `bge-m3` (candle, local weights) or `hash` (deterministic, no model).
    pub backend: String,
    pub model_dir: Option<String>,
    pub dim: usize,
    pub max_len: usize,
    pub max_batch: usize,
    pub batch_window_ms: u64,
    pub workers: usize,
    pub queue_depth: usize,
    /// Overrides the derived model-version tag stamped on cache and index rows.
    pub model_version: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: "bge-m3".into(),
            model_dir: None,
            dim: 1024,
            max_len: 256,
            max_batch: 32,
            batch_window_ms: 5,
            workers: 2,
            queue_depth: 1024,
            model_version: None,
        }
    }
}

impl EmbeddingSettings {
    pub fn batch_window(&self) -> Duration { Duration::from_millis(self.batch_window_ms) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub table: String,
    pub capacity: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self { Self { table: "emb_cache".into(), capacity: None } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexSettings {
    pub table: String,
    /// Tombstone share of a game partition that triggers compaction on write.
    pub compact_ratio: f32,
}

impl Default for IndexSettings {
    fn default() -> Self { Self { table: "index_entries".into(), compact_ratio: 0.25 } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub token_budget: usize,
    pub similarity_threshold: f32,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub failed_cooldown_secs: u64,
    /// Chunks embedded and committed per step of an indexing job.
    pub index_batch: usize,
    /// Recent query vectors kept in memory. They never reach the embedding cache.
    pub query_memo: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            token_budget: 2000,
            similarity_threshold: 0.35,
            timeout_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            failed_cooldown_secs: 60,
            index_batch: 64,
            query_memo: 256,
        }
    }
}

impl RetrievalSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }

    pub fn failed_cooldown(&self) -> Duration { Duration::from_secs(self.failed_cooldown_secs) }

    /// Exponential backoff for retry `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    // Expand ~ at start
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
