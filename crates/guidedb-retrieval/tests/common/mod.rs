#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guidedb_core::config::Settings;
use guidedb_core::error::{Error, Result};
use guidedb_core::traits::{Embedder, GuideStore, ModelLoader};
use guidedb_core::types::{normalize_game_id, GameRef, GuideDocument, GuideId, IndexStatus};
use guidedb_embed::HashEmbedder;
use guidedb_retrieval::RetrievalService;
use parking_lot::Mutex;

pub const DIM: usize = 256;
pub const GAME: &str = "zelda";
pub const PASSAGE: &str = "The Moonstone Key lies beneath the frozen waterfall behind the sleeping ogre.";
pub const QUERY: &str = "Moonstone Key frozen waterfall ogre";

/// Guide store backed by a map, with a switch to simulate an outage.
#[derive(Default)]
pub struct MemoryStore {
    guides: Mutex<BTreeMap<GuideId, GuideDocument>>,
    pub down: AtomicBool,
}

impl MemoryStore {
    pub fn put(&self, guide_id: &str, game: &str, text: String) {
        let doc = GuideDocument {
            guide_id: guide_id.to_string(),
            game_id: normalize_game_id(game),
            platform: "snes".into(),
            text,
            source: format!("guides/{guide_id}.md"),
        };
        self.guides.lock().insert(guide_id.to_string(), doc);
    }

    pub fn remove(&self, guide_id: &str) { self.guides.lock().remove(guide_id); }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Storage("guide store offline".into()));
        }
        Ok(())
    }
}

impl GuideStore for MemoryStore {
    fn guide(&self, guide_id: &str) -> Result<GuideDocument> {
        self.check()?;
        self.guides.lock().get(guide_id).cloned().ok_or_else(|| Error::NotFound(format!("guide {guide_id}")))
    }

    fn guides_for_game(&self, game_id: &str) -> Result<Vec<GuideId>> {
        self.check()?;
        Ok(self.guides.lock().values().filter(|g| g.game_id == game_id).map(|g| g.guide_id.clone()).collect())
    }

    fn games(&self) -> Result<Vec<GameRef>> {
        self.check()?;
        let mut games: Vec<GameRef> =
            self.guides.lock().values().map(|g| GameRef { game_id: g.game_id.clone(), platform: g.platform.clone() }).collect();
        games.dedup();
        Ok(games)
    }
}

/// Hash embedder with call counters, an optional delay and injectable failures.
pub struct ControlledEmbedder {
    inner: HashEmbedder,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
    pub delay_ms: AtomicU64,
    pub fail_next: AtomicUsize,
}

impl ControlledEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(DIM),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
        })
    }

    pub fn texts(&self) -> usize { self.texts.load(Ordering::SeqCst) }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

impl Embedder for ControlledEmbedder {
    fn dim(&self) -> usize { DIM }

    fn max_len(&self) -> usize { 256 }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("simulated inference failure");
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }
}

pub struct TestLoader {
    pub embedder: Arc<ControlledEmbedder>,
    pub version: String,
    pub broken: AtomicBool,
    pub loads: AtomicUsize,
}

impl TestLoader {
    pub fn new(embedder: Arc<ControlledEmbedder>, version: &str) -> Arc<Self> {
        Arc::new(Self { embedder, version: version.to_string(), broken: AtomicBool::new(false), loads: AtomicUsize::new(0) })
    }
}

impl ModelLoader for TestLoader {
    fn model_version(&self) -> String { self.version.clone() }

    fn dim(&self) -> usize { DIM }

    fn load(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("model weights missing");
        }
        Ok(self.embedder.clone() as Arc<dyn Embedder>)
    }
}

pub fn settings(db: &Path) -> Settings {
    let mut s = Settings::default();
    s.data.db_dir = db.to_string_lossy().into_owned();
    s.embedding.backend = "hash".into();
    s.embedding.dim = DIM;
    s.embedding.batch_window_ms = 1;
    s.retrieval.similarity_threshold = 0.05;
    s.retrieval.max_retries = 2;
    s.retrieval.backoff_base_ms = 5;
    s.retrieval.backoff_max_ms = 20;
    s
}

pub async fn start(settings: Settings, store: &Arc<MemoryStore>, loader: &Arc<TestLoader>) -> RetrievalService {
    RetrievalService::init(settings, store.clone(), loader.clone()).await.expect("service starts")
}

/// Filler prose of `words` whitespace tokens with [`PASSAGE`] placed near `at`.
pub fn guide_text(words: usize, at: usize) -> String {
    let mut tokens: Vec<String> = Vec::with_capacity(words + 16);
    let (mut i, mut placed) = (0, false);
    while tokens.len() < words {
        if !placed && tokens.len() >= at {
            tokens.extend(PASSAGE.split_whitespace().map(str::to_string));
            placed = true;
        }
        let sentence = format!("Walk to area{} and collect item{}.", i % 37, i % 53);
        tokens.extend(sentence.split_whitespace().map(str::to_string));
        i += 1;
    }
    tokens.truncate(words);
    tokens.join(" ")
}

/// Short unique guide text without the marker passage.
pub fn small_text(seed: usize) -> String {
    (0..40).map(|i| format!("Climb tower{seed} past gate{}.", i % 7)).collect::<Vec<_>>().join(" ")
}

pub async fn wait_for_status(service: &RetrievalService, guide_id: &str, want: IndexStatus) {
    for _ in 0..300 {
        if service.index_status(guide_id) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{guide_id} never reached {want}; last status {}", service.index_status(guide_id));
}
