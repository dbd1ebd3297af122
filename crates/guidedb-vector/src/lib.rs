#![deny(dead_code)]
#![deny(unused_variables)]

pub mod cache;
pub mod index;
pub mod schema;
pub mod table;

pub use cache::{content_hash, CacheStats, EmbeddingCache};
pub use index::{IndexEntry, SearchHit, VectorIndex};
