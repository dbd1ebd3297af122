use std::sync::Arc;

use crate::error::Result;
use crate::types::{GameRef, GuideDocument, GuideId};

/// A sentence embedding model. Implementations are CPU/GPU bound and get called
/// from blocking worker threads.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Loads an [`Embedder`] and names the model version its vectors belong to.
///
/// Loading may be slow and may fail (missing weights, no device); callers retry.
pub trait ModelLoader: Send + Sync {
    /// Identifier stored alongside every cached vector and index row.
    fn model_version(&self) -> String;
    fn dim(&self) -> usize;
    fn load(&self) -> anyhow::Result<Arc<dyn Embedder>>;
}

/// Read access to the external guide store.
pub trait GuideStore: Send + Sync {
    fn guide(&self, guide_id: &str) -> Result<GuideDocument>;
    fn guides_for_game(&self, game_id: &str) -> Result<Vec<GuideId>>;
    fn games(&self) -> Result<Vec<GameRef>>;
}

