//! Per-user long-term memory: storage, ranked retrieval, consolidation, and cleanup

pub mod embedding;
pub mod index;
pub mod manager;
pub mod models;
pub mod strategy;

pub use embedding::{cosine_similarity, CachedEmbedder, EmbeddingError, EmbeddingProvider, HashEmbedder, OllamaEmbedder};
pub use index::MemoryIndex;
pub use manager::{MemoryManager, StoredMemory};
pub use models::{
    CleanupReport, FactualMemory, MemoryItem, MemoryQuery, MemoryResult, MemorySource, MemoryType,
    NewMemory, Preference, Skill, UserMemoryProfile,
};
pub use strategy::{score_importance, Clusterer, SimilarityClusterer};
