use std::sync::Arc;

use common::{Chunk, QdrantSettings, ScoredChunk};
use embeddings::Embedder;
use qdrant_client::{
    Qdrant,
    qdrant::{
        Condition, CreateCollectionBuilder, DeleteCollectionBuilder, Distance, Filter,
        PointStruct, QueryPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
        value::Kind,
    },
};
use sha2::{Digest, Sha256};

use crate::{
    dense::{DenseFilter, DenseIndex},
    error::{IndexError, RetrievalError},
};

const PAYLOAD_CHUNK: &str = "chunk";
const PAYLOAD_COMPONENT: &str = "component_key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorSearchConfig {
    pub collection: String,
    pub distance: Distance,
    pub vector_dim: usize,
    pub upsert_batch: usize,
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        Self {
            collection: QdrantSettings::default().collection,
            distance: Distance::Cosine,
            vector_dim: 768,
            upsert_batch: 256,
        }
    }
}

impl VectorSearchConfig {
    pub fn from_settings(settings: &QdrantSettings, vector_dim: usize) -> Self {
        Self {
            collection: settings.collection.clone(),
            vector_dim,
            ..Self::default()
        }
    }
}

/// Qdrant-backed dense index. Component filtering runs inside Qdrant.
pub struct QdrantDenseIndex {
    client: Qdrant,
    config: VectorSearchConfig,
    embedder: Arc<dyn Embedder>,
}

impl QdrantDenseIndex {
    pub fn connect(
        url: &str,
        config: VectorSearchConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|err| IndexError::Backend(err.into()))?;
        Ok(Self {
            client,
            config,
            embedder,
        })
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// Drops the collection if present and creates it again, empty.
    pub async fn recreate_collection(&self) -> Result<(), IndexError> {
        if let Err(err) = self
            .client
            .delete_collection(DeleteCollectionBuilder::new(self.config.collection.clone()))
            .await
        {
            let msg = err.to_string().to_lowercase();
            if !msg.contains("not found") && !msg.contains("doesn't exist") {
                return Err(IndexError::Backend(err.into()));
            }
        }
        self.ensure_collection().await
    }

    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let builder =
            CreateCollectionBuilder::new(self.config.collection.clone()).vectors_config(
                VectorParamsBuilder::new(self.config.vector_dim as u64, self.config.distance),
            );

        if let Err(err) = self.client.create_collection(builder).await {
            let msg = err.to_string().to_lowercase();
            if !msg.contains("already exists") {
                return Err(IndexError::Backend(err.into()));
            }
        }
        Ok(())
    }

    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), IndexError> {
        for batch in chunks.chunks(self.config.upsert_batch.max(1)) {
            let texts = batch.iter().map(|c| c.content.clone()).collect::<Vec<_>>();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .map_err(|err| IndexError::Embedding(err.into()))?;

            let mut points = Vec::with_capacity(batch.len());
            for (chunk, vector) in batch.iter().zip(vectors) {
                let payload = serde_json::to_string(chunk).map_err(IndexError::Encode)?;
                points.push(PointStruct::new(
                    point_id(&chunk.fusion_key()),
                    vector,
                    [
                        (PAYLOAD_CHUNK, payload.into()),
                        (
                            PAYLOAD_COMPONENT,
                            chunk.meta.component.trim().to_lowercase().into(),
                        ),
                    ],
                ));
            }

            self.client
                .upsert_points(
                    UpsertPointsBuilder::new(self.config.collection.clone(), points).wait(true),
                )
                .await
                .map_err(|err| IndexError::Backend(err.into()))?;
        }
        tracing::info!(collection = %self.config.collection, chunks = chunks.len(), "upserted chunks into qdrant");
        Ok(())
    }
}

impl DenseIndex for QdrantDenseIndex {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&DenseFilter>,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self
            .embedder
            .embed_query(query)
            .map_err(|err| RetrievalError::Embedding(err.into()))?;

        let mut request = QueryPointsBuilder::new(self.config.collection.clone())
            .query(vector)
            .limit(k as u64)
            .with_payload(true);
        if let Some(filter) = filter.filter(|f| !f.components.is_empty()) {
            request = request.filter(Filter::must([Condition::matches(
                PAYLOAD_COMPONENT,
                filter.components.clone(),
            )]));
        }

        let response = self
            .client
            .query(request)
            .await
            .map_err(|err| RetrievalError::Dense(err.into()))?;

        let hits = response
            .result
            .iter()
            .filter_map(|pt| {
                let raw = match pt.payload.get(PAYLOAD_CHUNK)?.kind.as_ref()? {
                    Kind::StringValue(v) => v,
                    _ => return None,
                };
                match serde_json::from_str::<Chunk>(raw) {
                    Ok(chunk) => Some(ScoredChunk {
                        chunk,
                        score: f64::from(pt.score),
                    }),
                    Err(err) => {
                        tracing::warn!(collection = %self.config.collection, error = %err, "skipping point with undecodable chunk payload");
                        None
                    }
                }
            })
            .collect();
        Ok(hits)
    }
}

/// Stable Qdrant point id derived from a fusion key.
fn point_id(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use common::QdrantSettings;
    use qdrant_client::qdrant::Distance;

    use super::{VectorSearchConfig, point_id};

    #[test]
    fn defaults_to_cosine() {
        let cfg = VectorSearchConfig::from_settings(&QdrantSettings::default(), 384);
        assert_eq!(cfg.distance, Distance::Cosine);
        assert_eq!(cfg.collection, "sop_chunks");
        assert_eq!(cfg.vector_dim, 384);
    }

    #[test]
    fn point_id_is_stable() {
        assert_eq!(point_id("q1\u{241f}0\u{241f}t"), point_id("q1\u{241f}0\u{241f}t"));
        assert_ne!(point_id("q1\u{241f}0\u{241f}t"), point_id("q1\u{241f}1\u{241f}t"));
    }
}
