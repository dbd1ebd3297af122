#![deny(dead_code)]
#![deny(unused_variables)]

pub mod chunker;
pub mod config;
pub mod error;
pub mod guide_store;
pub mod traits;
pub mod types;

pub use chunker::{count_tokens, Chunker};
pub use error::{Error, Result};
pub use guide_store::FileSystemGuideStore;
pub use traits::{Embedder, GuideStore, ModelLoader};
