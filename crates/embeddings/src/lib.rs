pub mod config;
pub mod engine;

pub use config::EmbeddingConfig;
pub use engine::EmbeddingEngine;

/// Turns text into fixed-width vectors for the dense indexes.
///
/// Implementations must be deterministic for a given `embedder_id`: the flat index stores
/// vectors computed at build time and compares them with query vectors computed later.
pub trait Embedder: Send + Sync {
    /// Identifies the model and output width. Persisted next to stored vectors.
    fn embedder_id(&self) -> String;

    fn dim(&self) -> usize;

    fn embed_batch(&self, inputs: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn embed_query(&self, query: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))
    }
}

/// Scales `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}
