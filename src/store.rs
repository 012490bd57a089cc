//! Durable identity store abstraction. The relational table of
//! `(identity, encoded_vector, dedup_key)` rows lives outside this crate;
//! the index can always be rebuilt from it.

use anyhow::Result;
use parking_lot::Mutex;

use crate::index::Identity;

#[derive(Clone, Debug)]
pub struct EmbeddingRecord {
    pub identity: Identity,
    pub encoded_vector: Vec<u8>,
    pub dedup_key: String,
}

pub trait IdentityStore: Send + Sync {
    fn list_all_embeddings(&self) -> Result<Vec<EmbeddingRecord>>;
    fn insert_embedding(&self, record: EmbeddingRecord) -> Result<()>;
    /// Removes every record for the identity. Returns false when none existed.
    fn delete_identity(&self, identity: Identity) -> Result<bool>;
    fn contains(&self, identity: Identity, dedup_key: &str) -> Result<bool>;
}

/// In-process store used by tests and standalone deployments without a
/// relational backend.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<EmbeddingRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn list_all_embeddings(&self) -> Result<Vec<EmbeddingRecord>> {
        Ok(self.records.lock().clone())
    }

    fn insert_embedding(&self, record: EmbeddingRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn delete_identity(&self, identity: Identity) -> Result<bool> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.identity != identity);
        Ok(records.len() != before)
    }

    fn contains(&self, identity: Identity, dedup_key: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .iter()
            .any(|r| r.identity == identity && r.dedup_key == dedup_key))
    }
}
