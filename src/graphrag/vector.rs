//! The two vector collections backing semantic search: node descriptions
//! and pre-assembled context summaries. Both live in the same `rusqlite`
//! connection the state store's artifact table uses — there is no vector
//! database client crate in the dependency corpus, so similarity is a
//! flat cosine scan over blob-encoded `Vec<f32>` rows. Adequate for the
//! supported scale (≤ 10k nodes); not an ANN index.

use rusqlite::{params, Connection};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const EMBEDDING_DIM: usize = 128;
pub const UPSERT_BATCH_SIZE: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    NodeDescriptions,
    ContextSummaries,
}

impl Collection {
    fn table_name(&self) -> &'static str {
        match self {
            Collection::NodeDescriptions => "vec_node_descriptions",
            Collection::ContextSummaries => "vec_context_summaries",
        }
    }
}

/// A deterministic, seeded bag-of-tokens hashing embedding. Not a real
/// model call — LLM API calls are out of scope here — but stable across
/// rebuilds, which is what the byte-identical-rebuild property needs.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    for token in text.split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % EMBEDDING_DIM;
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
    vector
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap())).collect()
}

pub struct VectorStore {
    conn: Connection,
}

impl VectorStore {
    pub fn open(db_path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        Ok(Self { conn })
    }

    /// Drops and recreates a collection's table — the build pipeline
    /// never performs partial updates, only full rebuilds.
    pub fn recreate_collection(&self, collection: Collection) -> rusqlite::Result<()> {
        let table = collection.table_name();
        self.conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
        self.conn.execute(
            &format!("CREATE TABLE {table} (node_id TEXT PRIMARY KEY, embedding BLOB NOT NULL, text TEXT NOT NULL)"),
            [],
        )?;
        Ok(())
    }

    /// Upserts `(node_id, text)` pairs in batches of `UPSERT_BATCH_SIZE`,
    /// embedding each with the shared `hash_embedding` function.
    pub fn upsert_batch(&self, collection: Collection, records: &[(String, String)]) -> rusqlite::Result<()> {
        let table = collection.table_name();
        for chunk in records.chunks(UPSERT_BATCH_SIZE) {
            for (node_id, text) in chunk {
                let embedding = encode(&hash_embedding(text));
                self.conn.execute(
                    &format!("INSERT INTO {table} (node_id, embedding, text) VALUES (?1, ?2, ?3) ON CONFLICT(node_id) DO UPDATE SET embedding = excluded.embedding, text = excluded.text"),
                    params![node_id, embedding, text],
                )?;
            }
        }
        Ok(())
    }

    /// Flat cosine-similarity scan, returning the top `limit` `(node_id,
    /// score)` pairs in descending score order.
    pub fn search(&self, collection: Collection, query: &str, limit: usize) -> rusqlite::Result<Vec<(String, f64)>> {
        let query_embedding = hash_embedding(query);
        let table = collection.table_name();
        let mut stmt = self.conn.prepare(&format!("SELECT node_id, embedding FROM {table}"))?;
        let rows = stmt.query_map([], |row| {
            let node_id: String = row.get(0)?;
            let embedding: Vec<u8> = row.get(1)?;
            Ok((node_id, decode(&embedding)))
        })?;

        let mut scored: Vec<(String, f64)> = Vec::new();
        for row in rows {
            let (node_id, embedding) = row?;
            scored.push((node_id, cosine_similarity(&query_embedding, &embedding)));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored)
    }
}
