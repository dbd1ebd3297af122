//! Lance-backed embedding cache keyed by `(content_hash, model_version)`.
//!
//! Lookups are served from memory; misses are resolved against the persisted table
//! or computed through the [`EmbeddingGenerator`]. Concurrent misses for the same key
//! share one computation. New vectors are written to LanceDB on [`EmbeddingCache::flush`].
//!
//! An unreadable cache table is not fatal: the cache logs the corruption, points the
//! `meta` table at a fresh physical table and starts empty.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::{RecordBatch, StringArray, TimestampMillisecondArray};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use guidedb_core::config::CacheSettings;
use guidedb_core::error::{Error, Result};
use guidedb_embed::EmbeddingGenerator;
use lancedb::Connection;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::schema::{build_cache_schema, read_vector, string_column, vector_column, vector_width, vectors_array};
use crate::table::{self, ensure_width, sql_in, sql_str};

type Key = (String, String);
type Vector = Arc<Vec<f32>>;
type Pending = Shared<BoxFuture<'static, Result<Vector>>>;

const DELETE_CHUNK: usize = 256;

pub fn content_hash(text: &str) -> String { blake3::hash(text.as_bytes()).to_hex().to_string() }

struct Memory {
    hot: LruCache<Key, Vector>,
    /// Computed but not yet written.
    unflushed: HashMap<Key, Vector>,
    /// Known to exist in the table; may be evicted from `hot`.
    persisted: HashSet<Key>,
    forgotten: HashSet<String>,
}

impl Memory {
    fn new(capacity: Option<usize>) -> Self {
        let hot = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { hot, unflushed: HashMap::new(), persisted: HashSet::new(), forgotten: HashSet::new() }
    }

    fn get(&mut self, key: &Key) -> Option<Vector> {
        if let Some(v) = self.hot.get(key) {
            return Some(v.clone());
        }
        self.unflushed.get(key).cloned()
    }

    fn insert(&mut self, key: Key, vector: Vector) { self.hot.put(key, vector); }

    fn forget(&mut self, doomed: &HashSet<&String>) {
        let evict: Vec<Key> = self.hot.iter().map(|(k, _)| k).filter(|(h, _)| doomed.contains(h)).cloned().collect();
        for key in &evict {
            self.hot.pop(key);
        }
        self.unflushed.retain(|(h, _), _| !doomed.contains(h));
        self.persisted.retain(|(h, _)| !doomed.contains(h));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub computed: u64,
}

pub struct EmbeddingCache {
    conn: Connection,
    table: String,
    model_version: String,
    dim: usize,
    recovered: bool,
    memory: Mutex<Memory>,
    inflight: Mutex<HashMap<Key, Pending>>,
    flush_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    computed: AtomicU64,
}

impl EmbeddingCache {
    /// Open the cache for `model_version`, loading its persisted rows.
    pub async fn open(conn: Connection, settings: &CacheSettings, model_version: &str, dim: usize) -> Result<Self> {
        let active = table::active_table(&conn, &settings.table).await.map_err(Error::storage)?;
        let schema = build_cache_schema(dim).map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let (table, rows, recovered) = match load_rows(&conn, &active, model_version, dim).await {
            Ok(rows) => (active, rows, false),
            Err(err @ Error::CacheCorruption(_)) => {
                warn!(table = %active, error = %err, "embedding cache unreadable; starting a fresh table");
                let fresh = table::rotate_table(&conn, &settings.table, schema.clone()).await.map_err(Error::storage)?;
                (fresh, Vec::new(), true)
            }
            Err(e) => return Err(e),
        };
        table::ensure_table(&conn, &table, schema).await.map_err(Error::storage)?;

        let mut memory = Memory::new(settings.capacity);
        for (hash, vector) in rows {
            let key = (hash, model_version.to_string());
            memory.persisted.insert(key.clone());
            memory.insert(key, Arc::new(vector));
        }
        info!(table = %table, model_version, entries = memory.persisted.len(), "embedding cache opened");

        Ok(Self {
            conn,
            table,
            model_version: model_version.to_string(),
            dim,
            recovered,
            memory: Mutex::new(memory),
            inflight: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computed: AtomicU64::new(0),
        })
    }

    pub fn table(&self) -> &str { &self.table }

    pub fn model_version(&self) -> &str { &self.model_version }

    /// Whether opening had to abandon a corrupted table.
    pub fn recovered(&self) -> bool { self.recovered }

    pub fn len(&self) -> usize {
        let m = self.memory.lock();
        m.persisted.len() + m.unflushed.keys().filter(|k| !m.persisted.contains(*k)).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn unflushed(&self) -> usize { self.memory.lock().unflushed.len() }

    /// Vectors currently held in memory.
    pub fn resident(&self) -> usize { self.memory.lock().hot.len() }

    /// Computations still running.
    pub fn inflight(&self) -> usize { self.inflight.lock().len() }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
        }
    }

    /// Vector for `text` under the generator's model version, computing it at most once.
    pub async fn get_or_compute(self: &Arc<Self>, generator: &Arc<EmbeddingGenerator>, text: &str) -> Result<Vector> {
        let key = (content_hash(text), generator.model_version().to_string());
        if let Some(v) = self.memory.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }
        let pending = {
            let mut inflight = self.inflight.lock();
            // A computation may have finished between the two locks.
            if let Some(v) = self.memory.lock().get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v);
            }
            match inflight.get(&key) {
                Some(p) => p.clone(),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let p = self.clone().resolve(generator.clone(), key.clone(), text.to_string()).boxed().shared();
                    inflight.insert(key, p.clone());
                    // Runs to completion even when every waiter gives up.
                    tokio::spawn(p.clone());
                    p
                }
            }
        };
        pending.await
    }

    /// Vectors for `texts` in order. Misses are submitted together so the generator can batch them.
    pub async fn get_or_compute_many(self: &Arc<Self>, generator: &Arc<EmbeddingGenerator>, texts: &[String]) -> Result<Vec<Vector>> {
        futures::future::try_join_all(texts.iter().map(|t| self.get_or_compute(generator, t))).await
    }

    async fn resolve(self: Arc<Self>, generator: Arc<EmbeddingGenerator>, key: Key, text: String) -> Result<Vector> {
        let result = self.lookup_or_embed(&generator, &key, &text).await;
        if let Ok(v) = &result {
            self.memory.lock().insert(key.clone(), v.clone());
        }
        self.inflight.lock().remove(&key);
        result
    }

    async fn lookup_or_embed(&self, generator: &EmbeddingGenerator, key: &Key, text: &str) -> Result<Vector> {
        let known = self.memory.lock().persisted.contains(key);
        if known {
            match self.lookup(key).await {
                Ok(Some(v)) => return Ok(Arc::new(v)),
                Ok(None) => debug!(hash = %key.0, "persisted cache row vanished"),
                Err(e) => warn!(hash = %key.0, error = %e, "cache lookup failed; recomputing"),
            }
        }
        let vector = Arc::new(generator.embed_one(text).await?);
        self.computed.fetch_add(1, Ordering::Relaxed);
        self.memory.lock().unflushed.insert(key.clone(), vector.clone());
        Ok(vector)
    }

    async fn lookup(&self, key: &Key) -> Result<Option<Vec<f32>>> {
        let filter = format!("content_hash = {} AND model_version = {}", sql_str(&key.0), sql_str(&key.1));
        let mut found = None;
        table::scan(&self.conn, &self.table, Some(&filter), |batch| {
            if found.is_none() && batch.num_rows() > 0 {
                found = read_vector(vector_column(batch)?, 0);
            }
            Ok(())
        })
        .await
        .map_err(Error::storage)?;
        Ok(found.filter(|v| v.len() == self.dim))
    }

    /// Drop every entry for `hashes`, in memory now and in the table on the next flush.
    pub fn forget(&self, hashes: &[String]) {
        if hashes.is_empty() {
            return;
        }
        let doomed: HashSet<&String> = hashes.iter().collect();
        let mut m = self.memory.lock();
        m.forget(&doomed);
        m.forgotten.extend(hashes.iter().cloned());
        debug!(count = hashes.len(), "forgot cache entries");
    }

    /// Write pending deletions and new vectors to the table.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let (unflushed, forgotten) = {
            let mut m = self.memory.lock();
            (std::mem::take(&mut m.unflushed), std::mem::take(&mut m.forgotten))
        };
        if unflushed.is_empty() && forgotten.is_empty() {
            return Ok(());
        }
        match self.write(&unflushed, &forgotten).await {
            Ok(()) => {
                let mut m = self.memory.lock();
                m.persisted.extend(unflushed.keys().cloned());
                debug!(written = unflushed.len(), deleted = forgotten.len(), "embedding cache flushed");
                Ok(())
            }
            Err(e) => {
                let mut m = self.memory.lock();
                for (k, v) in unflushed {
                    m.unflushed.entry(k).or_insert(v);
                }
                m.forgotten.extend(forgotten);
                Err(e)
            }
        }
    }

    async fn write(&self, unflushed: &HashMap<Key, Vector>, forgotten: &HashSet<String>) -> Result<()> {
        let forgotten: Vec<String> = forgotten.iter().cloned().collect();
        for part in forgotten.chunks(DELETE_CHUNK) {
            table::delete_where(&self.conn, &self.table, &sql_in("content_hash", part)).await.map_err(Error::storage)?;
        }
        if unflushed.is_empty() {
            return Ok(());
        }
        let batch = self.rows(unflushed).map_err(Error::storage)?;
        let schema = batch.schema();
        table::append(&self.conn, &self.table, schema, vec![batch]).await.map_err(Error::storage)
    }

    fn rows(&self, entries: &HashMap<Key, Vector>) -> anyhow::Result<RecordBatch> {
        let now = Utc::now().timestamp_millis();
        let hashes: Vec<&str> = entries.keys().map(|(h, _)| h.as_str()).collect();
        let versions: Vec<&str> = entries.keys().map(|(_, v)| v.as_str()).collect();
        let vectors = vectors_array(entries.values().map(|v| v.as_slice()), self.dim)?;
        Ok(RecordBatch::try_new(
            build_cache_schema(self.dim)?,
            vec![
                Arc::new(StringArray::from(hashes)),
                Arc::new(StringArray::from(versions)),
                Arc::new(TimestampMillisecondArray::from(vec![now; entries.len()])),
                Arc::new(vectors),
            ],
        )?)
    }
}

/// Rows of `model_version` in `table`. A table that exists but cannot be read as a
/// cache table is reported as [`Error::CacheCorruption`].
async fn load_rows(conn: &Connection, table: &str, model_version: &str, dim: usize) -> Result<Vec<(String, Vec<f32>)>> {
    if !table::table_exists(conn, table).await.map_err(Error::storage)? {
        return Ok(Vec::new());
    }
    let corrupt = |e: anyhow::Error| Error::CacheCorruption(format!("{table}: {e:#}"));
    let schema = table::table_schema(conn, table).await.map_err(corrupt)?;
    ensure_width(dim, vector_width(&schema), table).map_err(corrupt)?;

    let mut rows = Vec::new();
    let filter = format!("model_version = {}", sql_str(model_version));
    table::scan(conn, table, Some(&filter), |batch| {
        let hashes = string_column(batch, "content_hash")?;
        let vectors = vector_column(batch)?;
        for i in 0..batch.num_rows() {
            if let Some(v) = read_vector(vectors, i) {
                rows.push((hashes.value(i).to_string(), v));
            }
        }
        Ok(())
    })
    .await
    .map_err(corrupt)?;
    Ok(rows)
}
