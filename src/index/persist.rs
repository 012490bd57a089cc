//! Snapshot persistence for [`IdentityIndex`]: a binary spatial artifact
//! (vectors + forest, CRC-framed bincode) and a JSON mapping artifact
//! written as a pair. Both are written to a temp file and atomically
//! renamed; a crash between the two renames is caught by the load-time
//! consistency check.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::forest::RpForest;
use super::{Identity, IdentityIndex, IndexSettings, InternalId};

const SPATIAL_MAGIC: [u8; 4] = *b"VSIX";
const SPATIAL_VERSION: u16 = 1;
const SPATIAL_HEADER_BYTES: usize = 10;
const MAPPING_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot missing: {0}")]
    Missing(PathBuf),
    #[error("snapshot artifacts disagree: {0}")]
    Inconsistent(String),
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct SnapshotLayout {
    pub spatial_path: PathBuf,
    pub mapping_path: PathBuf,
}

impl SnapshotLayout {
    pub fn new(base: &Path) -> Self {
        Self {
            spatial_path: base.join("index.bin"),
            mapping_path: base.join("index.mapping.json"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SpatialArtifact {
    dim: usize,
    next_internal_id: InternalId,
    vectors: BTreeMap<InternalId, Vec<f32>>,
    pending: BTreeSet<InternalId>,
    tombstones: usize,
    forest: RpForest,
}

#[derive(Serialize, Deserialize)]
struct MappingArtifact {
    version: u32,
    internal_id_to_identity: BTreeMap<InternalId, Identity>,
    identity_to_internal_ids: BTreeMap<Identity, BTreeSet<InternalId>>,
}

/// Writes both artifacts. A successful return means a matching pair is on
/// disk; on any error the previous pair is still intact.
pub fn save(layout: &SnapshotLayout, index: &IdentityIndex) -> Result<(), SnapshotError> {
    if let Some(dir) = layout.spatial_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let spatial = SpatialArtifact {
        dim: index.dim,
        next_internal_id: index.next_internal_id,
        vectors: index.vectors.clone(),
        pending: index.pending.clone(),
        tombstones: index.tombstones,
        forest: index.forest.clone(),
    };
    let payload = bincode::serialize(&spatial)
        .map_err(|err| SnapshotError::Corrupt(format!("encode spatial artifact: {err}")))?;
    write_framed(&layout.spatial_path, &payload)?;

    let mapping = MappingArtifact {
        version: MAPPING_VERSION,
        internal_id_to_identity: index.forward.clone(),
        identity_to_internal_ids: index
            .reverse
            .iter()
            .map(|(identity, ids)| (*identity, ids.clone()))
            .collect(),
    };
    let json = serde_json::to_vec_pretty(&mapping)
        .map_err(|err| SnapshotError::Corrupt(format!("encode mapping artifact: {err}")))?;
    write_atomic(&layout.mapping_path, &json)?;
    Ok(())
}

/// Loads the pair back into an index. Fails hard when either artifact is
/// absent, fails to decode, or when the two disagree about which
/// InternalIds exist.
pub fn load(layout: &SnapshotLayout, settings: IndexSettings) -> Result<IdentityIndex, SnapshotError> {
    if !layout.spatial_path.exists() {
        return Err(SnapshotError::Missing(layout.spatial_path.clone()));
    }
    if !layout.mapping_path.exists() {
        return Err(SnapshotError::Missing(layout.mapping_path.clone()));
    }

    let payload = read_framed(&layout.spatial_path)?;
    let spatial: SpatialArtifact = bincode::deserialize(&payload)
        .map_err(|err| SnapshotError::Corrupt(format!("decode spatial artifact: {err}")))?;
    let mapping_bytes = fs::read(&layout.mapping_path)?;
    let mapping: MappingArtifact = serde_json::from_slice(&mapping_bytes)
        .map_err(|err| SnapshotError::Corrupt(format!("decode mapping artifact: {err}")))?;

    for (id, vector) in &spatial.vectors {
        if vector.len() != spatial.dim {
            return Err(SnapshotError::Corrupt(format!(
                "vector {id} has dim {} in a dim-{} snapshot",
                vector.len(),
                spatial.dim
            )));
        }
    }

    let spatial_ids: BTreeSet<InternalId> = spatial.vectors.keys().copied().collect();
    let forward_ids: BTreeSet<InternalId> =
        mapping.internal_id_to_identity.keys().copied().collect();
    if spatial_ids != forward_ids {
        return Err(SnapshotError::Inconsistent(format!(
            "spatial artifact holds {} ids, mapping holds {}",
            spatial_ids.len(),
            forward_ids.len()
        )));
    }
    for (id, identity) in &mapping.internal_id_to_identity {
        if !mapping
            .identity_to_internal_ids
            .get(identity)
            .is_some_and(|ids| ids.contains(id))
        {
            return Err(SnapshotError::Inconsistent(format!(
                "forward entry {id} -> {identity} missing from reverse map"
            )));
        }
    }
    for (identity, ids) in &mapping.identity_to_internal_ids {
        if ids.is_empty() {
            return Err(SnapshotError::Inconsistent(format!(
                "identity {identity} maps to no vectors"
            )));
        }
        for id in ids {
            if mapping.internal_id_to_identity.get(id) != Some(identity) {
                return Err(SnapshotError::Inconsistent(format!(
                    "reverse map claims {id} for {identity}, forward map disagrees"
                )));
            }
        }
    }

    let max_id = spatial_ids.last().map(|id| id + 1).unwrap_or(0);
    Ok(IdentityIndex {
        dim: spatial.dim,
        settings,
        vectors: spatial.vectors,
        forward: mapping.internal_id_to_identity,
        reverse: mapping
            .identity_to_internal_ids
            .into_iter()
            .collect(),
        next_internal_id: spatial.next_internal_id.max(max_id),
        forest: spatial.forest,
        pending: spatial.pending,
        tombstones: spatial.tombstones,
    })
}

fn write_framed(path: &Path, payload: &[u8]) -> Result<(), SnapshotError> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let mut framed = Vec::with_capacity(SPATIAL_HEADER_BYTES + payload.len());
    framed.extend_from_slice(&SPATIAL_MAGIC);
    framed.extend_from_slice(&SPATIAL_VERSION.to_le_bytes());
    framed.extend_from_slice(&hasher.finalize().to_le_bytes());
    framed.extend_from_slice(payload);
    write_atomic(path, &framed)
}

fn read_framed(path: &Path) -> Result<Vec<u8>, SnapshotError> {
    let bytes = fs::read(path)?;
    if bytes.len() < SPATIAL_HEADER_BYTES {
        return Err(SnapshotError::Corrupt("spatial artifact truncated".into()));
    }
    if bytes[0..4] != SPATIAL_MAGIC {
        return Err(SnapshotError::Corrupt("spatial artifact bad magic".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != SPATIAL_VERSION {
        return Err(SnapshotError::Corrupt(format!(
            "spatial artifact version {version} unsupported"
        )));
    }
    let crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let payload = &bytes[SPATIAL_HEADER_BYTES..];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(SnapshotError::Corrupt(
            "spatial artifact checksum mismatch".into(),
        ));
    }
    Ok(payload.to_vec())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
