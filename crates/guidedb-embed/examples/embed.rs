use guidedb_core::config::EmbeddingSettings;
use guidedb_core::traits::{Embedder, ModelLoader};
use guidedb_embed::DefaultModelLoader;

// APP_USE_FAKE_EMBEDDINGS=1 runs this without model weights.
fn main() -> anyhow::Result<()> {
    let loader = DefaultModelLoader::new(EmbeddingSettings::default());
    let embedder = loader.load()?;
    let texts = vec!["Where is the hookshot?".to_string(), "The hookshot is in the Swamp Palace.".to_string()];
    let embs = embedder.embed_batch(&texts)?;
    let cosine: f32 = embs[0].iter().zip(&embs[1]).map(|(a, b)| a * b).sum();
    println!("model={} B={} dim={} cosine={cosine:.3}", loader.model_version(), embs.len(), embedder.dim());
    Ok(())
}
