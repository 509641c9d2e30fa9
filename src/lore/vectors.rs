use std::path::Path;

use rig::{
    Embed,
    client::{EmbeddingsClient, ProviderClient},
    embeddings::EmbeddingsBuilder,
    providers::{openai, openai::EmbeddingModel, openai::TEXT_EMBEDDING_3_SMALL},
    vector_store::VectorStoreIndex,
};
use rig_sqlite::{Column, ColumnValue, SqliteVectorIndex, SqliteVectorStore, SqliteVectorStoreTable};
use serde::{Deserialize, Serialize};
use sqlite_vec::sqlite3_vec_init;
use tokio_rusqlite::{Connection, ffi::sqlite3_auto_extension};

use crate::error::Result;
use crate::lore::pack::Chunk;

/// Embedded view of a lore chunk: id plus the section body, nothing else.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChunkDoc {
    id: String,
    content: String,
}

impl Embed for ChunkDoc {
    fn embed(
        &self,
        embedder: &mut rig::embeddings::TextEmbedder,
    ) -> std::result::Result<(), rig::embeddings::EmbedError> {
        embedder.embed(self.content.clone());
        Ok(())
    }
}

impl SqliteVectorStoreTable for ChunkDoc {
    fn name() -> &'static str {
        "chunk_embeddings"
    }

    fn schema() -> Vec<Column> {
        vec![
            Column::new("id", "TEXT PRIMARY KEY"),
            Column::new("content", "TEXT"),
        ]
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn column_values(&self) -> Vec<(&'static str, Box<dyn ColumnValue>)> {
        vec![
            ("id", Box::new(self.id.clone())),
            ("content", Box::new(self.content.clone())),
        ]
    }
}

/// Semantic ranking over installed chunks, backed by sqlite-vec in its own
/// database file next to the campaign store. Entirely optional: when no
/// embeddings client is configured the index ranks by FTS alone.
pub struct VectorLore {
    store: SqliteVectorStore<EmbeddingModel, ChunkDoc>,
    model: EmbeddingModel,
}

impl VectorLore {
    /// Requires `OPENAI_API_KEY` in the environment, like every other
    /// provider call in the engine.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let openai_client = openai::Client::from_env();
        unsafe {
            sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
        }
        let conn = Connection::open(db_path)
            .await
            .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        let model = openai_client.embedding_model(TEXT_EMBEDDING_3_SMALL);
        let store = SqliteVectorStore::new(conn, &model)
            .await
            .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        Ok(VectorLore { store, model })
    }

    /// Embed and insert freshly installed chunks. Runs at pack install,
    /// never during play.
    pub async fn add_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut builder = EmbeddingsBuilder::new(self.model.clone());
        for chunk in chunks {
            builder = builder
                .document(ChunkDoc {
                    id: chunk.id.clone(),
                    content: chunk.body.clone(),
                })
                .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        }
        let embeddings = builder
            .build()
            .await
            .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        self.store
            .add_rows(embeddings)
            .await
            .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        Ok(())
    }

    /// Top-n chunk ids by similarity, highest first, for stage-2 ranking.
    pub async fn top_ids(&self, query: &str, n: usize) -> Result<Vec<(String, f64)>> {
        let index = self.store.clone().index(self.model.clone());
        let hits = index
            .top_n::<ChunkDoc>(query, n)
            .await
            .map_err(|e| crate::error::Error::StringError(e.to_string()))?;
        Ok(hits
            .into_iter()
            .map(|(score, _, doc)| (doc.id, score))
            .collect())
    }
}
