pub mod index;
pub mod pack;
pub mod scene_cache;
pub mod vectors;

pub use index::{CorpusFilter, LoreIndex, LoreQuery, RetrievedChunk};
pub use pack::{Chunk, PackManifest};
pub use scene_cache::{DiscoverableHook, NpcBriefing, SceneLore};

/// Rough token estimate used for every budget decision in the engine. The
/// same estimator must be used at index build time and at packet build time
/// so budgets mean the same thing everywhere.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}
