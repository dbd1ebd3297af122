//! In-memory vector index partitioned by game.
//!
//! Each partition keeps its vectors in one contiguous buffer with a liveness flag per
//! slot. Removing or replacing a chunk tombstones its slot; compaction rewrites the
//! partition without dead slots. Readers work on an immutable snapshot, so a search
//! never observes a half-applied write. Writers copy the partitions they touch and
//! publish a new snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::SchemaRef;
use guidedb_core::error::{Error, Result};
use guidedb_core::types::{ChunkId, GameId, GuideId};
use guidedb_embed::l2_normalize;
use lancedb::Connection;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::schema::{build_index_schema, read_vector, string_column, vector_column, vector_width, vectors_array};
use crate::table::{self, ensure_width};

const PERSIST_BATCH: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: ChunkId,
    pub guide_id: GuideId,
    pub game_id: GameId,
    pub content_hash: String,
    pub source: String,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub guide_id: GuideId,
    pub source: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, PartialEq, Eq)]
struct Meta {
    chunk_id: ChunkId,
    guide_id: GuideId,
    content_hash: String,
    source: String,
    text: String,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    meta: Vec<Arc<Meta>>,
    vectors: Vec<f32>,
    live: Vec<bool>,
    slots: HashMap<ChunkId, usize>,
    tombstones: usize,
}

impl Partition {
    fn vector(&self, slot: usize, dim: usize) -> &[f32] { &self.vectors[slot * dim..(slot + 1) * dim] }

    fn live_len(&self) -> usize { self.meta.len() - self.tombstones }

    fn tombstone_ratio(&self) -> f32 {
        if self.meta.is_empty() {
            0.0
        } else {
            self.tombstones as f32 / self.meta.len() as f32
        }
    }

    fn upsert(&mut self, entry: IndexEntry) {
        self.remove(&entry.chunk_id);
        let IndexEntry { chunk_id, guide_id, content_hash, source, text, vector, .. } = entry;
        self.slots.insert(chunk_id.clone(), self.meta.len());
        self.meta.push(Arc::new(Meta { chunk_id, guide_id, content_hash, source, text }));
        self.vectors.extend_from_slice(&vector);
        self.live.push(true);
    }

    fn remove(&mut self, chunk_id: &str) -> Option<usize> {
        let slot = self.slots.remove(chunk_id)?;
        self.live[slot] = false;
        self.tombstones += 1;
        Some(slot)
    }

    fn compacted(&self, dim: usize) -> Partition {
        let mut out = Partition::default();
        for slot in (0..self.meta.len()).filter(|&s| self.live[s]) {
            out.slots.insert(self.meta[slot].chunk_id.clone(), out.meta.len());
            out.meta.push(self.meta[slot].clone());
            out.vectors.extend_from_slice(self.vector(slot, dim));
            out.live.push(true);
        }
        out
    }

    fn live_slots(&self) -> impl Iterator<Item = usize> + '_ { (0..self.meta.len()).filter(|&s| self.live[s]) }
}

#[derive(Debug, Default)]
struct Snapshot {
    partitions: BTreeMap<GameId, Arc<Partition>>,
}

pub struct VectorIndex {
    dim: usize,
    model_version: String,
    compact_ratio: f32,
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl VectorIndex {
    pub fn new(dim: usize, model_version: impl Into<String>, compact_ratio: f32) -> Self {
        Self {
            dim,
            model_version: model_version.into(),
            compact_ratio,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dim(&self) -> usize { self.dim }

    pub fn model_version(&self) -> &str { &self.model_version }

    fn current(&self) -> Arc<Snapshot> { self.snapshot.read().clone() }

    fn update<R>(&self, f: impl FnOnce(&mut BTreeMap<GameId, Arc<Partition>>) -> R) -> R {
        let _writer = self.writer.lock();
        let mut partitions = self.current().partitions.clone();
        let out = f(&mut partitions);
        partitions.retain(|_, p| !p.meta.is_empty());
        *self.snapshot.write() = Arc::new(Snapshot { partitions });
        out
    }

    /// Insert or replace one chunk.
    pub fn add(&self, entry: IndexEntry) -> Result<()> { self.add_many(vec![entry]) }

    /// Insert or replace chunks. Re-adding a chunk id supersedes its previous vector.
    pub fn add_many(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != self.dim) {
            return Err(Error::IndexInconsistency(format!(
                "chunk {} has a {}-dimensional vector, index expects {}",
                bad.chunk_id,
                bad.vector.len(),
                self.dim
            )));
        }
        if entries.is_empty() {
            return Ok(());
        }
        let (dim, ratio) = (self.dim, self.compact_ratio);
        let added = entries.len();
        self.update(|partitions| {
            let mut touched = BTreeSet::new();
            for mut entry in entries {
                l2_normalize(&mut entry.vector);
                for (game, p) in partitions.iter_mut() {
                    if *game != entry.game_id && p.slots.contains_key(&entry.chunk_id) {
                        Arc::make_mut(p).remove(&entry.chunk_id);
                        touched.insert(game.clone());
                    }
                }
                touched.insert(entry.game_id.clone());
                Arc::make_mut(partitions.entry(entry.game_id.clone()).or_default()).upsert(entry);
            }
            compact_over(partitions, &touched, dim, ratio);
        });
        debug!(added, "index entries added");
        Ok(())
    }

    /// Tombstone one chunk. Returns whether it was present.
    pub fn remove(&self, chunk_id: &str) -> bool { self.remove_chunks(&[chunk_id.to_string()]) == 1 }

    pub fn remove_chunks(&self, chunk_ids: &[ChunkId]) -> usize {
        let (dim, ratio) = (self.dim, self.compact_ratio);
        self.update(|partitions| {
            let mut removed = 0;
            let mut touched = BTreeSet::new();
            for (game, p) in partitions.iter_mut() {
                let hits: Vec<&ChunkId> = chunk_ids.iter().filter(|c| p.slots.contains_key(*c)).collect();
                if hits.is_empty() {
                    continue;
                }
                let p = Arc::make_mut(p);
                removed += hits.into_iter().filter(|c| p.remove(c).is_some()).count();
                touched.insert(game.clone());
            }
            compact_over(partitions, &touched, dim, ratio);
            removed
        })
    }

    /// Remove every chunk of a guide, returning what was removed.
    pub fn remove_guide(&self, guide_id: &str) -> Vec<IndexEntry> {
        let removed = self.guide_entries(guide_id);
        let ids: Vec<ChunkId> = removed.iter().map(|e| e.chunk_id.clone()).collect();
        self.remove_chunks(&ids);
        removed
    }

    /// Top `k` live chunks of `game_id` by cosine similarity to `query`, best first.
    pub fn search(&self, game_id: &str, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(Error::IndexInconsistency(format!("query has dimension {}, index expects {}", query.len(), self.dim)));
        }
        let snap = self.current();
        let Some(p) = snap.partitions.get(game_id) else { return Ok(Vec::new()) };
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(f32, usize)> = p.live_slots().map(|s| (dot(&q, p.vector(s, self.dim)), s)).collect();
        let order = |a: &(f32, usize), b: &(f32, usize)| b.0.total_cmp(&a.0).then_with(|| p.meta[a.1].chunk_id.cmp(&p.meta[b.1].chunk_id));
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, order);
            scored.truncate(k);
        }
        scored.sort_unstable_by(order);

        Ok(scored
            .into_iter()
            .map(|(score, s)| {
                let m = &p.meta[s];
                SearchHit { chunk_id: m.chunk_id.clone(), guide_id: m.guide_id.clone(), source: m.source.clone(), text: m.text.clone(), score }
            })
            .collect())
    }

    /// Rewrite every partition without its tombstones. Returns the number of slots reclaimed.
    pub fn compact(&self) -> usize {
        let dim = self.dim;
        self.update(|partitions| {
            let mut reclaimed = 0;
            for p in partitions.values_mut().filter(|p| p.tombstones > 0) {
                reclaimed += p.tombstones;
                *p = Arc::new(p.compacted(dim));
            }
            reclaimed
        })
    }

    /// Rewrite one game's partition without its tombstones.
    pub fn compact_game(&self, game_id: &str) -> usize {
        let dim = self.dim;
        self.update(|partitions| match partitions.get_mut(game_id) {
            Some(p) if p.tombstones > 0 => {
                let reclaimed = p.tombstones;
                *p = Arc::new(p.compacted(dim));
                reclaimed
            }
            _ => 0,
        })
    }

    /// Structural self-check: buffer sizes, liveness bookkeeping and the chunk-id map agree.
    pub fn is_consistent(&self) -> bool {
        let snap = self.current();
        let mut seen = HashSet::new();
        snap.partitions.values().all(|p| {
            p.vectors.len() == p.meta.len() * self.dim
                && p.live.len() == p.meta.len()
                && p.live.iter().filter(|l| !**l).count() == p.tombstones
                && p.slots.len() == p.live_len()
                && p.slots.iter().all(|(id, &s)| p.live[s] && p.meta[s].chunk_id == *id && seen.insert(id.clone()))
        })
    }

    pub fn len(&self) -> usize { self.current().partitions.values().map(|p| p.live_len()).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn game_len(&self, game_id: &str) -> usize { self.current().partitions.get(game_id).map_or(0, |p| p.live_len()) }

    pub fn tombstones(&self) -> usize { self.current().partitions.values().map(|p| p.tombstones).sum() }

    /// `(guide, game)` pairs with at least one live chunk.
    pub fn indexed_guides(&self) -> Vec<(GuideId, GameId)> {
        let snap = self.current();
        let mut out = BTreeSet::new();
        for (game, p) in &snap.partitions {
            for s in p.live_slots() {
                out.insert((p.meta[s].guide_id.clone(), game.clone()));
            }
        }
        out.into_iter().collect()
    }

    pub fn entry(&self, chunk_id: &str) -> Option<IndexEntry> {
        let snap = self.current();
        snap.partitions.iter().find_map(|(game, p)| p.slots.get(chunk_id).map(|&s| self.materialize(game, p, s)))
    }

    pub fn guide_entries(&self, guide_id: &str) -> Vec<IndexEntry> {
        let snap = self.current();
        snap.partitions
            .iter()
            .flat_map(|(game, p)| {
                p.live_slots().filter(move |&s| p.meta[s].guide_id == guide_id).map(move |s| self.materialize(game, p, s))
            })
            .collect()
    }

    pub fn guide_chunk_ids(&self, guide_id: &str) -> Vec<ChunkId> {
        self.guide_entries(guide_id).into_iter().map(|e| e.chunk_id).collect()
    }

    /// Live chunks whose text hashes to `content_hash`.
    pub fn hash_refcount(&self, content_hash: &str) -> usize {
        let snap = self.current();
        snap.partitions.values().map(|p| p.live_slots().filter(|&s| p.meta[s].content_hash == content_hash).count()).sum()
    }

    pub fn clear(&self) { self.update(|partitions| partitions.clear()); }

    fn materialize(&self, game: &str, p: &Partition, slot: usize) -> IndexEntry {
        let m = &p.meta[slot];
        IndexEntry {
            chunk_id: m.chunk_id.clone(),
            guide_id: m.guide_id.clone(),
            game_id: game.to_string(),
            content_hash: m.content_hash.clone(),
            source: m.source.clone(),
            text: m.text.clone(),
            vector: p.vector(slot, self.dim).to_vec(),
        }
    }

    /// Rewrite the persisted index from the live entries.
    ///
    /// Rows go to a fresh table that replaces the active one in a single meta commit,
    /// so an interrupted rewrite leaves the previous state loadable.
    pub async fn persist(&self, conn: &Connection, base: &str) -> Result<usize> {
        let _guard = self.persist_lock.lock().await;
        self.rewrite(conn, base).await
    }

    /// Persist the current entries of `guide_ids` only, in one commit. Falls back to a
    /// full rewrite when the active table is missing or was written for another model
    /// or vector width.
    pub async fn persist_guides(&self, conn: &Connection, base: &str, guide_ids: &[GuideId]) -> Result<usize> {
        if guide_ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.persist_lock.lock().await;
        let active = table::active_table(conn, base).await.map_err(Error::storage)?;
        if !self.writable(conn, base, &active).await? {
            return self.rewrite(conn, base).await;
        }

        let wanted: HashSet<&str> = guide_ids.iter().map(String::as_str).collect();
        let wanted = &wanted;
        let snap = self.current();
        let rows: Vec<IndexEntry> = snap
            .partitions
            .iter()
            .flat_map(|(game, p)| p.live_slots().filter(move |&s| wanted.contains(p.meta[s].guide_id.as_str())).map(move |s| (game, p, s)))
            .map(|(game, p, s)| self.materialize(game, p, s))
            .collect();
        let scope = table::sql_in("guide_id", guide_ids);
        if rows.is_empty() {
            table::delete_where(conn, &active, &scope).await.map_err(Error::storage)?;
        } else {
            let batches = self.batches(&rows)?;
            let schema = self.schema()?;
            table::replace_where(conn, &active, "chunk_id", &scope, schema, batches).await.map_err(Error::storage)?;
        }
        debug!(table = %active, guides = guide_ids.len(), rows = rows.len(), "guide rows persisted");
        Ok(rows.len())
    }

    async fn writable(&self, conn: &Connection, base: &str, active: &str) -> Result<bool> {
        if !table::table_exists(conn, active).await.map_err(Error::storage)? {
            return Ok(false);
        }
        let stored = table::get_meta(conn, &version_key(base)).await.map_err(Error::storage)?;
        if stored.as_deref() != Some(self.model_version.as_str()) {
            return Ok(false);
        }
        let existing = table::table_schema(conn, active).await.map_err(Error::storage)?;
        Ok(vector_width(&existing) == Some(self.dim))
    }

    async fn rewrite(&self, conn: &Connection, base: &str) -> Result<usize> {
        let (staged, rows) = self.stage(conn, base).await?;
        self.publish(conn, base, &staged).await?;
        info!(table = %staged, rows, "index persisted");
        Ok(rows)
    }

    /// Write every live entry to a new table nobody reads yet.
    async fn stage(&self, conn: &Connection, base: &str) -> Result<(String, usize)> {
        let snap = self.current();
        let rows: Vec<IndexEntry> = snap
            .partitions
            .iter()
            .flat_map(|(game, p)| p.live_slots().map(move |s| (game, p, s)))
            .map(|(game, p, s)| self.materialize(game, p, s))
            .collect();
        let staged = table::fresh_table_name(base);
        let schema = self.schema()?;
        table::ensure_table(conn, &staged, schema.clone()).await.map_err(Error::storage)?;
        table::append(conn, &staged, schema, self.batches(&rows)?).await.map_err(Error::storage)?;
        Ok((staged, rows.len()))
    }

    /// Make `staged` the active table and record the model version it holds.
    async fn publish(&self, conn: &Connection, base: &str, staged: &str) -> Result<()> {
        let version = vec![(version_key(base), self.model_version.clone())];
        let previous = table::publish_table(conn, base, staged, &version).await.map_err(Error::storage)?;
        if previous != staged && table::table_exists(conn, &previous).await.map_err(Error::storage)? {
            if let Err(e) = table::delete_where(conn, &previous, "chunk_id IS NOT NULL").await {
                warn!(table = %previous, error = %e, "could not clear the replaced index table");
            }
        }
        Ok(())
    }

    fn schema(&self) -> Result<SchemaRef> { build_index_schema(self.dim).map_err(|e| Error::InvalidConfig(e.to_string())) }

    fn batches(&self, rows: &[IndexEntry]) -> Result<Vec<RecordBatch>> {
        rows.chunks(PERSIST_BATCH)
            .map(|part| self.rows(part))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(Error::storage)
    }

    fn rows(&self, entries: &[IndexEntry]) -> anyhow::Result<RecordBatch> {
        let col = |f: fn(&IndexEntry) -> &str| -> ArrayRef { Arc::new(StringArray::from(entries.iter().map(f).collect::<Vec<&str>>())) };
        Ok(RecordBatch::try_new(
            build_index_schema(self.dim)?,
            vec![
                col(|e| &e.chunk_id),
                col(|e| &e.guide_id),
                col(|e| &e.game_id),
                col(|e| &e.content_hash),
                col(|e| &e.source),
                col(|e| &e.text),
                Arc::new(StringArray::from(vec![self.model_version.as_str(); entries.len()])),
                Arc::new(vectors_array(entries.iter().map(|e| e.vector.as_slice()), self.dim)?),
            ],
        )?)
    }

    /// Load the persisted index for `model_version`.
    ///
    /// Fails with [`Error::IndexInconsistency`] when the stored rows were built by a
    /// different model or cannot be decoded; callers then rebuild from scratch.
    pub async fn load(conn: &Connection, base: &str, model_version: &str, dim: usize, compact_ratio: f32) -> Result<Self> {
        let index = Self::new(dim, model_version, compact_ratio);
        let active = table::active_table(conn, base).await.map_err(Error::storage)?;
        if !table::table_exists(conn, &active).await.map_err(Error::storage)? {
            return Ok(index);
        }
        if let Some(stored) = table::get_meta(conn, &version_key(base)).await.map_err(Error::storage)? {
            if stored != model_version {
                return Err(Error::IndexInconsistency(format!("index built with {stored}, current model is {model_version}")));
            }
        }
        let inconsistent = |e: anyhow::Error| Error::IndexInconsistency(format!("{active}: {e:#}"));
        let schema = table::table_schema(conn, &active).await.map_err(inconsistent)?;
        ensure_width(dim, vector_width(&schema), &active).map_err(inconsistent)?;

        let mut entries = Vec::new();
        table::scan(conn, &active, None, |batch| {
            let chunk = string_column(batch, "chunk_id")?;
            let guide = string_column(batch, "guide_id")?;
            let game = string_column(batch, "game_id")?;
            let hash = string_column(batch, "content_hash")?;
            let source = string_column(batch, "source")?;
            let text = string_column(batch, "text")?;
            let version = string_column(batch, "model_version")?;
            let vectors = vector_column(batch)?;
            for i in 0..batch.num_rows() {
                anyhow::ensure!(version.value(i) == model_version, "row {} was embedded by {}", chunk.value(i), version.value(i));
                let vector = read_vector(vectors, i).ok_or_else(|| anyhow::anyhow!("row {} has no vector", chunk.value(i)))?;
                entries.push(IndexEntry {
                    chunk_id: chunk.value(i).to_string(),
                    guide_id: guide.value(i).to_string(),
                    game_id: game.value(i).to_string(),
                    content_hash: hash.value(i).to_string(),
                    source: source.value(i).to_string(),
                    text: text.value(i).to_string(),
                    vector,
                });
            }
            Ok(())
        })
        .await
        .map_err(inconsistent)?;

        let count = entries.len();
        index.add_many(entries)?;
        info!(table = %active, entries = count, model_version, "index loaded");
        Ok(index)
    }
}

fn version_key(base: &str) -> String { format!("index_model_version:{base}") }

fn dot(a: &[f32], b: &[f32]) -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() }

fn compact_over(partitions: &mut BTreeMap<GameId, Arc<Partition>>, games: &BTreeSet<GameId>, dim: usize, ratio: f32) {
    for game in games {
        if let Some(p) = partitions.get_mut(game) {
            if p.tombstones > 0 && p.tombstone_ratio() > ratio {
                debug!(game = %game, tombstones = p.tombstones, "compacting partition");
                *p = Arc::new(p.compacted(dim));
            }
        }
    }
}
