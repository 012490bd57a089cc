mod forest;
pub mod persist;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use forest::RpForest;

/// Opaque external identifier owned by the surrounding user store. The index
/// associates vectors with identities but never creates or destroys them.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Dense index-local id. Never reused after removal, so a stale reference can
/// only miss, never alias a different vector.
pub type InternalId = u64;

/// Width of the distance buckets used when ranking hits: candidates whose
/// distances quantize to the same bucket are tied and ordered by InternalId
/// for reproducible results.
pub const DISTANCE_TIE_EPS: f32 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector dim mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },
    #[error("identity not found")]
    IdentityNotFound,
}

#[derive(Clone, Debug)]
pub struct IndexSettings {
    pub trees: usize,
    pub leaf_size: usize,
    pub seed: u64,
    pub search_oversample: usize,
    /// Fresh inserts are brute-forced until this many accumulate, then the
    /// forest is rebuilt in one pass.
    pub pending_rebuild_limit: usize,
    /// Forest rebuild trigger after this many removals; 0 disables the
    /// trigger and leaves reclamation to explicit rebuild/compact.
    pub tombstone_rebuild_limit: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            trees: 10,
            leaf_size: 16,
            seed: 0xFACE,
            search_oversample: 4,
            pending_rebuild_limit: 64,
            tombstone_rebuild_limit: 256,
        }
    }
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trees: config.forest_trees.max(1),
            leaf_size: config.forest_leaf_size.max(2),
            seed: config.forest_seed,
            search_oversample: config.search_oversample.max(1),
            pending_rebuild_limit: config.pending_rebuild_limit.max(1),
            tombstone_rebuild_limit: config.tombstone_rebuild_limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub identity: Identity,
    pub internal_id: InternalId,
    /// Angular distance in [0, 2]; 0 means identical direction.
    pub distance: f32,
}

/// The single owner of search state: a vector store, the forward and reverse
/// id maps, and the spatial forest. All three co-evolve under the mutation
/// methods; callers never touch them directly.
#[derive(Clone)]
pub struct IdentityIndex {
    dim: usize,
    settings: IndexSettings,
    vectors: BTreeMap<InternalId, Vec<f32>>,
    forward: BTreeMap<InternalId, Identity>,
    reverse: HashMap<Identity, BTreeSet<InternalId>>,
    next_internal_id: InternalId,
    forest: RpForest,
    /// Inserted since the last forest build; searched brute-force.
    pending: BTreeSet<InternalId>,
    /// Removed ids still physically present in the forest.
    tombstones: usize,
}

impl IdentityIndex {
    pub fn new(dim: usize, settings: IndexSettings) -> Self {
        let leaf_size = settings.leaf_size;
        Self {
            dim,
            settings,
            vectors: BTreeMap::new(),
            forward: BTreeMap::new(),
            reverse: HashMap::new(),
            next_internal_id: 0,
            forest: RpForest::empty(leaf_size),
            pending: BTreeSet::new(),
            tombstones: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn count_identities(&self) -> usize {
        self.reverse.len()
    }

    pub fn count_vectors(&self) -> usize {
        self.forward.len()
    }

    /// Inserts an already-normalized vector for `identity` and returns the
    /// assigned InternalId. The forest is refreshed only once enough pending
    /// inserts accumulate; until then the new vector is searched brute-force.
    pub fn insert(&mut self, identity: Identity, vector: Vec<f32>) -> Result<InternalId, IndexError> {
        let id = self.insert_unindexed(identity, vector)?;
        if self.pending.len() >= self.settings.pending_rebuild_limit {
            self.rebuild_forest();
        }
        debug_assert!(self.is_consistent());
        Ok(id)
    }

    fn insert_unindexed(
        &mut self,
        identity: Identity,
        vector: Vec<f32>,
    ) -> Result<InternalId, IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let id = self.next_internal_id;
        self.next_internal_id += 1;
        self.vectors.insert(id, vector);
        self.forward.insert(id, identity);
        self.reverse.entry(identity).or_default().insert(id);
        self.pending.insert(id);
        Ok(id)
    }

    /// Nearest neighbors of `query`, at most `k`, ascending by angular
    /// distance with ties broken by lower InternalId. Candidates come from
    /// the forest plus the pending set; anything absent from the forward map
    /// (a tombstone) is dropped, so a removed identity can never surface.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.forward.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let want = k.saturating_mul(self.settings.search_oversample).max(k);
        let mut candidates = self.forest.query(query, want);
        candidates.extend(self.pending.iter().copied());
        candidates.sort_unstable();
        candidates.dedup();

        let mut hits = Vec::with_capacity(candidates.len().min(want));
        for id in candidates {
            let Some(&identity) = self.forward.get(&id) else {
                continue;
            };
            let Some(vector) = self.vectors.get(&id) else {
                continue;
            };
            hits.push(SearchHit {
                identity,
                internal_id: id,
                distance: angular_distance(query, vector),
            });
        }
        hits.sort_by(cmp_hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Removes every vector mapped to `identity` from the maps. Forest
    /// entries become unreachable tombstones reclaimed on the next rebuild.
    /// Returns how many vectors were removed.
    pub fn remove_identity(&mut self, identity: Identity) -> Result<usize, IndexError> {
        let Some(ids) = self.reverse.remove(&identity) else {
            return Err(IndexError::IdentityNotFound);
        };
        let mut new_tombstones = 0usize;
        for id in &ids {
            self.forward.remove(id);
            self.vectors.remove(id);
            if !self.pending.remove(id) {
                new_tombstones += 1;
            }
        }
        self.tombstones += new_tombstones;
        let limit = self.settings.tombstone_rebuild_limit;
        if limit > 0 && self.tombstones >= limit {
            self.rebuild_forest();
        }
        debug_assert!(self.is_consistent());
        Ok(ids.len())
    }

    /// Atomically replaces the entire state from `(identity, vector)` pairs.
    /// Previous InternalIds are discarded along with any tombstones.
    pub fn rebuild(
        &mut self,
        pairs: impl IntoIterator<Item = (Identity, Vec<f32>)>,
    ) -> Result<(), IndexError> {
        let mut fresh = IdentityIndex::new(self.dim, self.settings.clone());
        for (identity, vector) in pairs {
            fresh.insert_unindexed(identity, vector)?;
        }
        fresh.rebuild_forest();
        *self = fresh;
        debug_assert!(self.is_consistent());
        Ok(())
    }

    /// Rebuilds the forest from live vectors only, reclaiming tombstones
    /// without changing InternalIds or the id maps.
    pub fn compact(&mut self) {
        self.rebuild_forest();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    fn rebuild_forest(&mut self) {
        self.forest = RpForest::build(
            self.settings.leaf_size,
            self.settings.trees,
            self.settings.seed,
            &self.vectors,
        );
        self.pending.clear();
        self.tombstones = 0;
    }

    /// Verifies invariants: every stored vector has exactly one forward
    /// entry, forward and reverse agree in both directions, and every live
    /// id is reachable by search (forest or pending).
    pub fn is_consistent(&self) -> bool {
        if self.vectors.len() != self.forward.len() {
            return false;
        }
        for (id, identity) in &self.forward {
            if !self.vectors.contains_key(id) {
                return false;
            }
            if !self
                .reverse
                .get(identity)
                .is_some_and(|ids| ids.contains(id))
            {
                return false;
            }
        }
        for (identity, ids) in &self.reverse {
            if ids.is_empty() {
                return false;
            }
            for id in ids {
                if self.forward.get(id) != Some(identity) {
                    return false;
                }
            }
        }
        // Every live id must be reachable by search: either still pending
        // or physically present in the forest.
        let indexed = self.forest.indexed_ids();
        self.forward
            .keys()
            .all(|id| self.pending.contains(id) || indexed.contains(id))
    }
}

pub fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    (2.0 - 2.0 * forest::dot(a, b)).max(0.0).sqrt()
}

fn cmp_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    tie_bucket(a.distance)
        .cmp(&tie_bucket(b.distance))
        .then(a.internal_id.cmp(&b.internal_id))
}

// Comparing quantized distances keeps the comparator a total order; a raw
// "within epsilon" test is intransitive across chains of near-ties.
fn tie_bucket(distance: f32) -> i64 {
    (distance / DISTANCE_TIE_EPS).round() as i64
}
