//! Domain types shared by the chunker, cache, index and retrieval service.

use serde::{Deserialize, Serialize};
use std::ops::Range;

pub type ChunkId = String;
pub type GuideId = String;
pub type GameId = String;

/// A guide as handed over by the external guide store.
///
/// - `guide_id`: stable identity assigned by the store
/// - `game_id`: normalized game this guide belongs to (see [`normalize_game_id`])
/// - `platform`: console/platform label, informational only
/// - `text`: the raw guide body
/// - `source`: where the text came from (path or URL), echoed in formatted context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuideDocument {
    pub guide_id: GuideId,
    pub game_id: GameId,
    pub platform: String,
    pub text: String,
    pub source: String,
}

/// A game known to the guide store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GameRef {
    pub game_id: GameId,
    pub platform: String,
}

/// An overlap-preserving slice of one guide, the unit of embedding and retrieval.
///
/// `span` is the byte range of `text` inside the parent guide text; `tokens` is the
/// whitespace token count of `text`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub guide_id: GuideId,
    pub ordinal: usize,
    pub span: Range<usize>,
    pub text: String,
    pub tokens: usize,
}

impl Chunk {
    pub fn make_id(guide_id: &str, ordinal: usize) -> ChunkId { format!("{guide_id}#{ordinal}") }
}

/// Indexing lifecycle of a guide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotIndexed,
    Indexing,
    Indexed,
    Failed,
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexStatus::NotIndexed => "not_indexed",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One ranked passage. `score` is cosine similarity, higher is better.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    pub chunk_id: ChunkId,
    pub guide_id: GuideId,
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Why a retrieval result may be missing context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// No guide of the game is indexed yet; indexing was scheduled.
    NotIndexed,
    /// Some guides of the game are still indexing or failed; results cover the rest.
    Partial,
    /// The embedding model is not loaded.
    ModelUnavailable,
    /// The guide store could not list the game's guides.
    StoreUnavailable,
}

/// Ordered passages, highest score first, possibly empty.
///
/// An empty result with `degraded` set means "context not yet available", not
/// "nothing relevant exists".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub passages: Vec<RetrievedPassage>,
    pub degraded: Option<Degradation>,
}

impl RetrievalResult {
    pub fn degraded(reason: Degradation) -> Self { Self { passages: Vec::new(), degraded: Some(reason) } }

    pub fn is_empty(&self) -> bool { self.passages.is_empty() }

    pub fn is_complete(&self) -> bool { self.degraded.is_none() }
}

/// Canonical form of a game name: trimmed, lowercased, inner whitespace as `-`.
pub fn normalize_game_id(name: &str) -> GameId {
    name.split_whitespace().collect::<Vec<_>>().join("-").to_lowercase()
}
