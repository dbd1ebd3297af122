//! Retrieval service: owns the cache, index and model, runs indexing jobs and
//! answers "top passages for this game" queries.
//!
//! Indexing of one game is serialized behind that game's lock. A guide has at most
//! one job in flight; later triggers await the same shared future. Retrieval never
//! waits for indexing: guides that are not indexed yet get a background job and the
//! caller receives a degraded result.
//!
//! Storage writes happen after the game lock is released and cover only the guide
//! that changed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use guidedb_core::chunker::Chunker;
use guidedb_core::config::{expand_path, Settings};
use guidedb_core::error::{Error, Result};
use guidedb_core::traits::{GuideStore, ModelLoader};
use guidedb_core::types::{
    normalize_game_id, ChunkId, Degradation, GameId, GuideId, IndexStatus, RetrievalResult, RetrievedPassage,
};
use guidedb_embed::EmbeddingGenerator;
use guidedb_vector::{content_hash, table, EmbeddingCache, IndexEntry, VectorIndex};
use lancedb::Connection;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{fit_budget, format_context};
use crate::status::{aggregate, StatusBoard};

type Job = Shared<BoxFuture<'static, Result<IndexStatus>>>;

/// Outcome of one guide in a bulk indexing run.
pub type GuideOutcome = (GuideId, Result<IndexStatus>);

pub struct RetrievalService {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    store: Arc<dyn GuideStore>,
    loader: Arc<dyn ModelLoader>,
    chunker: Chunker,
    conn: Connection,
    cache: Arc<EmbeddingCache>,
    index: Arc<VectorIndex>,
    model: RwLock<Option<Arc<EmbeddingGenerator>>>,
    model_load: AsyncMutex<()>,
    status: StatusBoard,
    game_locks: Mutex<HashMap<GameId, Arc<AsyncMutex<()>>>>,
    jobs: Mutex<HashMap<GuideId, Job>>,
    /// Recent query vectors by text hash. Kept out of the embedding cache, which only
    /// holds chunk text.
    queries: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    shutdown: CancellationToken,
}

impl RetrievalService {
    /// Open the database under `settings.data.db_dir`, restore the cache and index and
    /// load the embedding model.
    ///
    /// An unusable persisted index is replaced by an empty one. A model that still fails
    /// after the configured retries leaves the service running without one; it is
    /// loaded again on demand.
    pub async fn init(settings: Settings, store: Arc<dyn GuideStore>, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        settings.validate()?;
        let chunker = Chunker::new(settings.chunking)?;
        let db_path = expand_path(&settings.data.db_dir);
        std::fs::create_dir_all(&db_path).map_err(Error::storage)?;
        let conn = table::open_db(&db_path.to_string_lossy()).await.map_err(Error::storage)?;

        let (version, dim) = (loader.model_version(), loader.dim());
        let ratio = settings.index.compact_ratio;
        let index = match VectorIndex::load(&conn, &settings.index.table, &version, dim, ratio).await {
            Ok(index) => index,
            Err(Error::IndexInconsistency(reason)) => {
                warn!(%reason, "persisted index unusable; rebuilding from scratch");
                VectorIndex::new(dim, version.clone(), ratio)
            }
            Err(e) => return Err(e),
        };
        let cache = EmbeddingCache::open(conn.clone(), &settings.cache, &version, dim).await?;

        let memo = NonZeroUsize::new(settings.retrieval.query_memo)
            .ok_or_else(|| Error::InvalidConfig("retrieval.query_memo must be > 0".into()))?;
        let status = StatusBoard::new();
        let restored = index.indexed_guides();
        for (guide_id, game_id) in &restored {
            status.mark_indexed(guide_id, game_id);
        }

        let inner = Arc::new(Inner {
            settings,
            store,
            loader,
            chunker,
            conn,
            cache: Arc::new(cache),
            index: Arc::new(index),
            model: RwLock::new(None),
            model_load: AsyncMutex::new(()),
            status,
            game_locks: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            queries: Mutex::new(LruCache::new(memo)),
            shutdown: CancellationToken::new(),
        });
        inner.load_model_with_retry().await;
        info!(
            db = %db_path.display(),
            model_version = %version,
            guides = restored.len(),
            entries = inner.index.len(),
            model_ready = inner.model().is_some(),
            "retrieval service ready"
        );
        Ok(Self { inner })
    }

    /// Stop background jobs, then flush the cache. Index rows are already written per guide.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let running: Vec<Job> = self.inner.jobs.lock().values().cloned().collect();
        join_all(running).await;
        self.inner.cache.flush().await?;
        info!("retrieval service stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings { &self.inner.settings }

    pub fn model_ready(&self) -> bool { self.inner.model().is_some() }

    pub fn index(&self) -> &Arc<VectorIndex> { &self.inner.index }

    pub fn cache(&self) -> &Arc<EmbeddingCache> { &self.inner.cache }

    pub fn index_status(&self, guide_id: &str) -> IndexStatus { self.inner.status.get(guide_id) }

    /// Index one guide and wait for the outcome. Joins the guide's running job if there is one.
    pub async fn index_guide(&self, guide_id: &str) -> Result<IndexStatus> { self.inner.job(guide_id).await }

    /// Index every guide the store lists for `game`.
    pub async fn index_game(&self, game: &str) -> Result<Vec<GuideOutcome>> {
        let guides = self.inner.store.guides_for_game(&normalize_game_id(game))?;
        let jobs: Vec<Job> = guides.iter().map(|g| self.inner.job(g)).collect();
        let results = join_all(jobs).await;
        Ok(guides.into_iter().zip(results).collect())
    }

    /// Index every guide of every game.
    pub async fn index_all(&self) -> Result<Vec<GuideOutcome>> {
        let games: BTreeSet<GameId> = self.inner.store.games()?.into_iter().map(|g| g.game_id).collect();
        let mut out = Vec::new();
        for run in join_all(games.iter().map(|g| self.index_game(g))).await {
            out.extend(run?);
        }
        Ok(out)
    }

    /// Status of each guide the store lists for `game`.
    pub fn game_statuses(&self, game: &str) -> Result<Vec<(GuideId, IndexStatus)>> {
        let guides = self.inner.store.guides_for_game(&normalize_game_id(game))?;
        Ok(guides
            .into_iter()
            .map(|g| {
                let s = self.inner.status.get(&g);
                (g, s)
            })
            .collect())
    }

    pub fn game_status(&self, game: &str) -> Result<IndexStatus> {
        Ok(aggregate(self.game_statuses(game)?.into_iter().map(|(_, s)| s)))
    }

    /// Remove every index entry of a guide and the cache entries only it used.
    ///
    /// A running job for the guide is cancelled; it stops before its next embedding
    /// batch and releases the game lock this call then takes.
    pub async fn delete_guide_index(&self, guide_id: &str) -> Result<()> {
        let inner = &self.inner;
        let game = inner.status.cancel(guide_id).or_else(|| {
            inner.index.indexed_guides().into_iter().find(|(g, _)| g == guide_id).map(|(_, game)| game)
        });
        let lock = game.as_deref().map(|g| inner.game_lock(g));
        let guard = match &lock {
            Some(l) => Some(l.lock().await),
            None => None,
        };
        let removed = inner.index.remove_guide(guide_id);
        if let Some(g) = &game {
            inner.index.compact_game(g);
        }
        inner.forget_orphans(&removed);
        inner.status.reset(guide_id);
        drop(guard);
        inner.persist(guide_id).await?;
        info!(guide_id, removed = removed.len(), "guide index deleted");
        Ok(())
    }

    /// Guide store notification that a guide is gone.
    pub async fn on_guide_deleted(&self, guide_id: &str) -> Result<()> { self.delete_guide_index(guide_id).await }

    /// Best passages of `game` for `query`, at most `k`, within `token_budget` tokens.
    ///
    /// Fails only with [`Error::RetrievalTimeout`]; every other problem yields a
    /// degraded result.
    pub async fn retrieve(&self, game: &str, query: &str, k: usize, token_budget: usize) -> Result<RetrievalResult> {
        let limit = self.inner.settings.retrieval.timeout();
        let game = normalize_game_id(game);
        let work = self.inner.clone().retrieve_within(game.clone(), query.to_string(), k, token_budget);
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(game_id = %game, ?limit, "retrieval timed out");
                Err(Error::RetrievalTimeout(limit))
            }
        }
    }

    /// [`Self::retrieve`] rendered as prompt context for the chat layer.
    pub async fn context_for_query(&self, game: &str, query: &str, k: usize, token_budget: usize) -> Result<String> {
        let result = self.retrieve(game, query, k, token_budget).await?;
        Ok(format_context(&result.passages))
    }
}

impl Inner {
    fn model(&self) -> Option<Arc<EmbeddingGenerator>> { self.model.read().clone() }

    /// The loaded model, loading it first if needed. One load runs at a time.
    async fn ensure_model(&self) -> Result<Arc<EmbeddingGenerator>> {
        if let Some(m) = self.model() {
            return Ok(m);
        }
        let _guard = self.model_load.lock().await;
        if let Some(m) = self.model() {
            return Ok(m);
        }
        let generator = Arc::new(EmbeddingGenerator::load(self.loader.clone(), &self.settings.embedding).await?);
        *self.model.write() = Some(generator.clone());
        Ok(generator)
    }

    async fn load_model_with_retry(&self) {
        let retries = self.settings.retrieval.max_retries;
        for attempt in 0..=retries {
            match self.ensure_model().await {
                Ok(_) => return,
                Err(e) if attempt < retries => {
                    let delay = self.settings.retrieval.backoff(attempt);
                    warn!(attempt, ?delay, error = %e, "embedding model failed to load; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => warn!(error = %e, "embedding model unavailable; serving degraded results"),
            }
        }
    }

    fn spawn_model_load(self: &Arc<Self>) {
        if self.model_load.try_lock().is_err() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.ensure_model().await {
                debug!(error = %e, "background model load failed");
            }
        });
    }

    fn game_lock(&self, game_id: &str) -> Arc<AsyncMutex<()>> {
        self.game_locks.lock().entry(game_id.to_string()).or_default().clone()
    }

    /// The guide's running job, or a new one started in the background.
    fn job(self: &Arc<Self>, guide_id: &str) -> Job {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(guide_id) {
            return job.clone();
        }
        let cancel = self.status.begin(guide_id, &self.shutdown);
        let inner = self.clone();
        let id = guide_id.to_string();
        let job = async move {
            let outcome = inner.run_job(&id, cancel).await;
            inner.jobs.lock().remove(&id);
            outcome
        }
        .boxed()
        .shared();
        jobs.insert(guide_id.to_string(), job.clone());
        tokio::spawn(job.clone());
        job
    }

    async fn run_job(&self, guide_id: &str, cancel: CancellationToken) -> Result<IndexStatus> {
        let retries = self.settings.retrieval.max_retries;
        let mut attempt = 0;
        loop {
            match self.index_once(guide_id, &cancel).await {
                Ok(()) => return Ok(self.status.get(guide_id)),
                Err(Error::Cancelled(_)) => {
                    info!(guide_id, "indexing cancelled");
                    self.status.abandon(guide_id);
                    return Ok(self.status.get(guide_id));
                }
                Err(Error::NotFound(what)) => {
                    self.status.reset(guide_id);
                    return Err(Error::NotFound(what));
                }
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = self.settings.retrieval.backoff(attempt);
                    warn!(guide_id, attempt, ?delay, error = %e, "indexing attempt failed; retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.status.abandon(guide_id);
                            return Ok(self.status.get(guide_id));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(guide_id, error = %e, "indexing failed");
                    self.status.fail(guide_id);
                    return Ok(IndexStatus::Failed);
                }
            }
        }
    }

    fn cancelled(guide_id: &str) -> Error { Error::Cancelled(format!("indexing of {guide_id}")) }

    /// One indexing attempt. Chunking, embedding and index updates run under the game
    /// lock; the guide's rows are written once it is released. Re-running it for
    /// unchanged text neither computes embeddings nor changes the entry count.
    async fn index_once(&self, guide_id: &str, cancel: &CancellationToken) -> Result<()> {
        let doc = self.store.guide(guide_id)?;
        let game = normalize_game_id(&doc.game_id);
        self.status.set_game(guide_id, &game);

        let lock = self.game_lock(&game);
        let guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(Self::cancelled(guide_id));
        }
        let model = self.ensure_model().await?;
        let chunks = self.chunker.chunk_guide(&doc)?;
        let previous = self.index.guide_chunk_ids(guide_id);

        for batch in chunks.chunks(self.settings.retrieval.index_batch) {
            if cancel.is_cancelled() {
                return Err(Self::cancelled(guide_id));
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.cache.get_or_compute_many(&model, &texts).await?;
            let entries = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexEntry {
                    chunk_id: chunk.id.clone(),
                    guide_id: guide_id.to_string(),
                    game_id: game.clone(),
                    content_hash: content_hash(&chunk.text),
                    source: doc.source.clone(),
                    text: chunk.text.clone(),
                    vector: vector.to_vec(),
                })
                .collect();
            self.index.add_many(entries)?;
            debug!(guide_id, batch = batch.len(), "chunk batch indexed");
        }

        let current: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<ChunkId> = previous.into_iter().filter(|id| !current.contains(id.as_str())).collect();
        if !stale.is_empty() {
            let dropped: Vec<IndexEntry> = stale.iter().filter_map(|id| self.index.entry(id)).collect();
            self.index.remove_chunks(&stale);
            self.forget_orphans(&dropped);
            debug!(guide_id, stale = stale.len(), "dropped chunks no longer produced");
        }
        let reclaimed = self.index.compact_game(&game);
        drop(guard);

        self.persist(guide_id).await?;
        if !self.status.finish(guide_id) {
            return Err(Self::cancelled(guide_id));
        }
        info!(guide_id, game_id = %game, chunks = chunks.len(), reclaimed, "guide indexed");
        Ok(())
    }

    /// Drop cached vectors whose text no index entry uses any more.
    fn forget_orphans(&self, removed: &[IndexEntry]) {
        let orphans: BTreeSet<String> =
            removed.iter().map(|e| e.content_hash.clone()).filter(|h| self.index.hash_refcount(h) == 0).collect();
        let orphans: Vec<String> = orphans.into_iter().collect();
        self.cache.forget(&orphans);
    }

    /// Write new cache rows and the guide's current index rows.
    async fn persist(&self, guide_id: &str) -> Result<()> {
        self.cache.flush().await?;
        let rows = self.index.persist_guides(&self.conn, &self.settings.index.table, &[guide_id.to_string()]).await?;
        debug!(guide_id, rows, "guide persisted");
        Ok(())
    }

    async fn embed_query(&self, model: &EmbeddingGenerator, query: &str) -> Result<Arc<Vec<f32>>> {
        let key = content_hash(query);
        if let Some(v) = self.queries.lock().get(&key) {
            return Ok(v.clone());
        }
        let vector = Arc::new(model.embed_one(query).await?);
        self.queries.lock().put(key, vector.clone());
        Ok(vector)
    }

    async fn retrieve_within(self: Arc<Self>, game: GameId, query: String, k: usize, budget: usize) -> Result<RetrievalResult> {
        if k == 0 || query.trim().is_empty() {
            return Ok(RetrievalResult::default());
        }
        let guides = match self.store.guides_for_game(&game) {
            Ok(guides) => guides,
            Err(e) => {
                warn!(game_id = %game, error = %e, "guide store unavailable");
                return Ok(RetrievalResult::degraded(Degradation::StoreUnavailable));
            }
        };
        if guides.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let cooldown = self.settings.retrieval.failed_cooldown();
        let (mut indexed, mut incomplete) = (false, false);
        for guide_id in &guides {
            if self.status.is_due(guide_id, cooldown) {
                debug!(guide_id, "scheduling background indexing");
                drop(self.job(guide_id));
            }
            match self.status.get(guide_id) {
                IndexStatus::Indexed => indexed = true,
                _ => incomplete = true,
            }
        }

        let Some(model) = self.model() else {
            self.spawn_model_load();
            return Ok(RetrievalResult::degraded(Degradation::ModelUnavailable));
        };
        if !indexed {
            return Ok(RetrievalResult::degraded(Degradation::NotIndexed));
        }

        let query_vector = match self.embed_query(&model, &query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(game_id = %game, error = %e, "query embedding failed");
                return Ok(RetrievalResult::degraded(Degradation::ModelUnavailable));
            }
        };
        let hits = self.index.search(&game, &query_vector, k)?;

        let listed: HashSet<&str> = guides.iter().map(String::as_str).collect();
        let threshold = self.settings.retrieval.similarity_threshold;
        let ranked: Vec<RetrievedPassage> = hits
            .into_iter()
            .filter(|h| h.score >= threshold && listed.contains(h.guide_id.as_str()))
            .map(|h| RetrievedPassage { chunk_id: h.chunk_id, guide_id: h.guide_id, source: h.source, text: h.text, score: h.score })
            .collect();
        let passages = fit_budget(ranked, budget);
        debug!(game_id = %game, passages = passages.len(), incomplete, "retrieval done");
        Ok(RetrievalResult { passages, degraded: incomplete.then_some(Degradation::Partial) })
    }
}
