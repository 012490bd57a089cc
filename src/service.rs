//! Enrollment and recognition pipelines around the one process-wide
//! [`IdentityIndex`]. The `Service` handle is cheap to clone and is the only
//! way callers mutate search state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::Config;
use crate::embedding::{self, CodecError};
use crate::index::persist::{self, SnapshotError, SnapshotLayout};
use crate::index::{Identity, IdentityIndex, IndexError, IndexSettings, InternalId};
use crate::model::Embedder;
use crate::store::{EmbeddingRecord, IdentityStore};

#[derive(Clone)]
pub struct Service(Arc<Inner>);

struct Inner {
    config: Config,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IdentityStore>,
    index: RwLock<IdentityIndex>,
    layout: Option<SnapshotLayout>,
    save_lock: Mutex<()>,
    snapshot_loaded: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no face embedding produced")]
    NoFaceEmbeddingProduced,
    #[error("identity not found")]
    IdentityNotFound,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("identity store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EnrollOutcome {
    Enrolled {
        identity: Identity,
        internal_id: InternalId,
    },
    /// The same `(identity, dedup_key)` pair was submitted before; the index
    /// was left untouched.
    AlreadyEnrolled,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct IdentityMatch {
    pub identity: Identity,
    /// `1 - angular distance`; higher is more similar.
    pub similarity: f32,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct Stats {
    pub identity_count: usize,
    pub vector_count: usize,
    pub snapshot_loaded: bool,
}

impl Service {
    /// Builds the process-wide service: loads the snapshot when one exists,
    /// otherwise rebuilds from the durable store. A rejected snapshot
    /// (inconsistent or corrupt pair) is logged and replaced by a rebuild.
    pub fn open(
        config: Config,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn IdentityStore>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            embedder.dim() == config.embedding_dim,
            "embedder produces dim {} but EMBEDDING_DIM is {}",
            embedder.dim(),
            config.embedding_dim
        );
        let settings = IndexSettings::from_config(&config);
        let layout = config
            .data_dir
            .as_ref()
            .map(|dir| SnapshotLayout::new(Path::new(dir)));

        let mut snapshot_loaded = false;
        let index = match &layout {
            Some(layout) => match persist::load(layout, settings.clone()) {
                Ok(index) => {
                    anyhow::ensure!(
                        index.dim() == config.embedding_dim,
                        "snapshot dim {} does not match EMBEDDING_DIM {}",
                        index.dim(),
                        config.embedding_dim
                    );
                    snapshot_loaded = true;
                    tracing::info!(
                        vectors = index.count_vectors(),
                        identities = index.count_identities(),
                        "snapshot loaded"
                    );
                    index
                }
                Err(SnapshotError::Missing(path)) => {
                    tracing::info!(path = %path.display(), "no snapshot, rebuilding from store");
                    index_from_store(&config, settings.clone(), store.as_ref())?
                }
                Err(err @ (SnapshotError::Inconsistent(_) | SnapshotError::Corrupt(_))) => {
                    tracing::warn!(error = %err, "snapshot rejected, rebuilding from store");
                    index_from_store(&config, settings.clone(), store.as_ref())?
                }
                Err(SnapshotError::Io(err)) => return Err(err.into()),
            },
            None => index_from_store(&config, settings.clone(), store.as_ref())?,
        };

        let service = Self(Arc::new(Inner {
            config,
            embedder,
            store,
            index: RwLock::new(index),
            layout,
            save_lock: Mutex::new(()),
            snapshot_loaded: AtomicBool::new(snapshot_loaded),
        }));
        if !snapshot_loaded {
            service.save_snapshot()?;
        }
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Embeds the crop, deduplicates on `(identity, dedup_key)` against the
    /// durable store, then inserts, records and snapshots. Re-submitting the
    /// same capture is idempotent.
    pub fn enroll(
        &self,
        face_crop: &[u8],
        identity: Identity,
        dedup_key: Option<String>,
    ) -> Result<EnrollOutcome, ServiceError> {
        let raw = self
            .embed_with_retry(face_crop)
            .ok_or(ServiceError::NoFaceEmbeddingProduced)?;
        if raw.len() != self.0.config.embedding_dim {
            return Err(IndexError::DimMismatch {
                expected: self.0.config.embedding_dim,
                actual: raw.len(),
            }
            .into());
        }
        let vector = embedding::l2_normalize(raw);
        let dedup_key = dedup_key.unwrap_or_else(|| embedding::dedup_key(face_crop));

        if self
            .0
            .store
            .contains(identity, &dedup_key)
            .map_err(ServiceError::Store)?
        {
            tracing::info!(identity = %identity, "duplicate capture, already enrolled");
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        let encoded = embedding::encode_embedding(&vector);
        let internal_id = {
            let mut index = self.0.index.write();
            index.insert(identity, vector)?
        };
        self.0
            .store
            .insert_embedding(EmbeddingRecord {
                identity,
                encoded_vector: encoded,
                dedup_key,
            })
            .map_err(ServiceError::Store)?;
        self.save_snapshot()?;
        tracing::info!(identity = %identity, internal_id, "enrolled");
        Ok(EnrollOutcome::Enrolled {
            identity,
            internal_id,
        })
    }

    /// Ranked identity matches for a face crop, best first. Model failure
    /// and an empty index both yield an empty list; "unknown face" is a
    /// normal outcome, not an error.
    pub fn recognize(
        &self,
        face_crop: &[u8],
        threshold: Option<f32>,
        top_k: Option<usize>,
    ) -> Vec<IdentityMatch> {
        let threshold = threshold.unwrap_or(self.0.config.match_threshold);
        let top_k = top_k
            .unwrap_or(self.0.config.default_top_k)
            .min(self.0.config.max_k);
        let Some(raw) = self.embed_with_retry(face_crop) else {
            return Vec::new();
        };
        let query = embedding::l2_normalize(raw);

        // Oversample so duplicate vectors of one identity cannot crowd out
        // the k-th distinct identity.
        let hits = {
            let index = self.0.index.read();
            match index.search(&query, top_k.saturating_mul(4).max(top_k)) {
                Ok(hits) => hits,
                Err(err) => {
                    tracing::warn!(error = %err, "search failed");
                    return Vec::new();
                }
            }
        };

        let mut best: HashMap<Identity, f32> = HashMap::new();
        for hit in hits {
            let similarity = 1.0 - hit.distance;
            let entry = best.entry(hit.identity).or_insert(similarity);
            if similarity > *entry {
                *entry = similarity;
            }
        }
        let mut matches: Vec<IdentityMatch> = best
            .into_iter()
            .filter(|(_, similarity)| *similarity >= threshold)
            .map(|(identity, similarity)| IdentityMatch {
                identity,
                similarity,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.identity.cmp(&b.identity))
        });
        matches.truncate(top_k);
        matches
    }

    /// Privacy delete: drops every vector for the identity from the live
    /// index and the durable store, then snapshots. Returns how many vectors
    /// were removed from the index.
    pub fn remove_identity(&self, identity: Identity) -> Result<usize, ServiceError> {
        let removed = {
            let mut index = self.0.index.write();
            match index.remove_identity(identity) {
                Ok(n) => n,
                Err(IndexError::IdentityNotFound) => 0,
                Err(err) => return Err(err.into()),
            }
        };
        let in_store = self
            .0
            .store
            .delete_identity(identity)
            .map_err(ServiceError::Store)?;
        if removed == 0 && !in_store {
            return Err(ServiceError::IdentityNotFound);
        }
        self.save_snapshot()?;
        tracing::info!(identity = %identity, removed, "identity removed");
        Ok(removed)
    }

    /// Full rebuild from the durable store. The replacement index is built
    /// off-lock while the current one keeps serving reads, then swapped in.
    pub fn rebuild(&self) -> Result<(), ServiceError> {
        let settings = IndexSettings::from_config(&self.0.config);
        let fresh = index_from_store_typed(&self.0.config, settings, self.0.store.as_ref())?;
        *self.0.index.write() = fresh;
        self.save_snapshot()?;
        tracing::info!("index rebuilt from store");
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let index = self.0.index.read();
        Stats {
            identity_count: index.count_identities(),
            vector_count: index.count_vectors(),
            snapshot_loaded: self.0.snapshot_loaded.load(Ordering::Relaxed),
        }
    }

    fn embed_with_retry(&self, face_crop: &[u8]) -> Option<Vec<f32>> {
        let attempts = self.0.config.embed_attempts.max(1);
        for attempt in 1..=attempts {
            match self.0.embedder.embed(face_crop) {
                Ok(raw) => {
                    // A zero-norm vector cannot be normalized and carries no
                    // identity signal; treat it like a failed embedding.
                    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if !raw.is_empty() && norm > 0.0 && norm.is_finite() {
                        return Some(raw);
                    }
                    tracing::warn!(attempt, "embedder returned a degenerate vector");
                }
                Err(err) => tracing::warn!(attempt, error = %err, "embedder failed"),
            }
        }
        None
    }

    /// Clones the index under a read lock and writes the pair outside any
    /// index lock. The clone is taken only after `save_lock` is held, so a
    /// writer that loses the race cannot overwrite a newer pair with older
    /// state. Transient I/O failures are retried a bounded number of times
    /// before surfacing.
    fn save_snapshot(&self) -> Result<(), ServiceError> {
        let Some(layout) = &self.0.layout else {
            return Ok(());
        };
        let _guard = self.0.save_lock.lock();
        let snapshot = self.0.index.read().clone();
        let attempts = self.0.config.snapshot_save_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match persist::save(layout, &snapshot) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "snapshot save failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                SnapshotError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "snapshot save failed",
                ))
            })
            .into())
    }
}

fn index_from_store(
    config: &Config,
    settings: IndexSettings,
    store: &dyn IdentityStore,
) -> anyhow::Result<IdentityIndex> {
    index_from_store_typed(config, settings, store).map_err(Into::into)
}

fn index_from_store_typed(
    config: &Config,
    settings: IndexSettings,
    store: &dyn IdentityStore,
) -> Result<IdentityIndex, ServiceError> {
    let records = store.list_all_embeddings().map_err(ServiceError::Store)?;
    let mut pairs = Vec::with_capacity(records.len());
    for record in records {
        let vector = embedding::decode_embedding(&record.encoded_vector)?;
        if vector.len() != config.embedding_dim {
            return Err(IndexError::DimMismatch {
                expected: config.embedding_dim,
                actual: vector.len(),
            }
            .into());
        }
        pairs.push((record.identity, embedding::l2_normalize(vector)));
    }
    let mut index = IdentityIndex::new(config.embedding_dim, settings);
    index.rebuild(pairs)?;
    Ok(index)
}
