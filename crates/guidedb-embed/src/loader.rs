use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use guidedb_core::config::{expand_path, EmbeddingSettings};
use guidedb_core::traits::{Embedder, ModelLoader};
use tracing::info;

use crate::bge::BgeM3Embedder;
use crate::hash::HashEmbedder;

pub const BACKEND_BGE_M3: &str = "bge-m3";
pub const BACKEND_HASH: &str = "hash";

/// `APP_USE_FAKE_EMBEDDINGS=1` forces the hashing backend regardless of configuration.
pub fn use_fake_embeddings() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Loads the configured embedding backend.
#[derive(Debug, Clone)]
pub struct DefaultModelLoader {
    settings: EmbeddingSettings,
}

impl DefaultModelLoader {
    pub fn new(mut settings: EmbeddingSettings) -> Self {
        if use_fake_embeddings() {
            settings.backend = BACKEND_HASH.to_string();
        }
        Self { settings }
    }

    pub fn backend(&self) -> &str { &self.settings.backend }

    fn resolve_model_dir(&self) -> Result<PathBuf> {
        let configured = self.settings.model_dir.as_deref().map(expand_path);
        let from_env = ["APP_MODEL_DIR", "MODEL_DIR"].into_iter().filter_map(|k| std::env::var(k).ok()).map(PathBuf::from);
        let fallbacks = [PathBuf::from("../models/bge-m3"), PathBuf::from("models/bge-m3")];
        configured
            .into_iter()
            .chain(from_env)
            .chain(fallbacks)
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("could not locate the BGE-M3 model directory"))
    }
}

impl ModelLoader for DefaultModelLoader {
    fn model_version(&self) -> String {
        self.settings
            .model_version
            .clone()
            .unwrap_or_else(|| format!("{}:d{}", self.settings.backend, self.settings.dim))
    }

    fn dim(&self) -> usize { self.settings.dim }

    fn load(&self) -> Result<Arc<dyn Embedder>> {
        match self.settings.backend.as_str() {
            BACKEND_HASH => {
                info!(dim = self.settings.dim, "using hashing embedder");
                Ok(Arc::new(HashEmbedder::new(self.settings.dim)))
            }
            BACKEND_BGE_M3 => {
                let dir = self.resolve_model_dir()?;
                info!(dir = %dir.display(), "loading BGE-M3");
                Ok(Arc::new(BgeM3Embedder::load(&dir, self.settings.dim, self.settings.max_len)?))
            }
            other => bail!("unknown embedding backend {other:?}"),
        }
    }
}
