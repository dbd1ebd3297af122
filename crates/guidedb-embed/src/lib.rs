#![deny(dead_code)]
#![deny(unused_variables)]

pub mod bge;
pub mod device;
pub mod generator;
pub mod hash;
pub mod loader;
pub mod pool;
pub mod tokenize;

pub use bge::BgeM3Embedder;
pub use generator::{l2_normalize, EmbeddingGenerator};
pub use hash::HashEmbedder;
pub use loader::{use_fake_embeddings, DefaultModelLoader};
pub use pool::masked_mean_l2;
