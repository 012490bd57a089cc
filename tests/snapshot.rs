use std::fs;

use visage::embedding::l2_normalize;
use visage::index::persist::{self, SnapshotError, SnapshotLayout};
use visage::index::{Identity, IdentityIndex, IndexSettings};

fn toy_settings() -> IndexSettings {
    IndexSettings {
        trees: 4,
        leaf_size: 4,
        seed: 7,
        search_oversample: 8,
        pending_rebuild_limit: 4,
        tombstone_rebuild_limit: 0,
    }
}

fn ring_vector(i: u64) -> Vec<f32> {
    let angle = i as f32 * 0.47;
    l2_normalize(vec![angle.cos(), angle.sin(), 0.3, 0.2])
}

fn populated_index(n: u64) -> IdentityIndex {
    let mut index = IdentityIndex::new(4, toy_settings());
    for i in 0..n {
        index.insert(Identity(i % 5), ring_vector(i)).unwrap();
    }
    index
}

#[test]
fn save_load_roundtrip_preserves_search() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    let index = populated_index(20);
    persist::save(&layout, &index).unwrap();

    let loaded = persist::load(&layout, toy_settings()).unwrap();
    assert_eq!(loaded.count_identities(), index.count_identities());
    assert_eq!(loaded.count_vectors(), index.count_vectors());
    assert!(loaded.is_consistent());

    let query = ring_vector(33);
    assert_eq!(
        loaded.search(&query, 6).unwrap(),
        index.search(&query, 6).unwrap()
    );
}

#[test]
fn no_temp_files_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    persist::save(&layout, &populated_index(8)).unwrap();
    for entry in fs::read_dir(dir.path()).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        assert!(!name.ends_with(".tmp"), "leftover temp file: {name}");
    }
}

#[test]
fn missing_artifacts_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    assert!(matches!(
        persist::load(&layout, toy_settings()),
        Err(SnapshotError::Missing(_))
    ));

    persist::save(&layout, &populated_index(8)).unwrap();
    fs::remove_file(&layout.mapping_path).unwrap();
    assert!(matches!(
        persist::load(&layout, toy_settings()),
        Err(SnapshotError::Missing(_))
    ));

    persist::save(&layout, &populated_index(8)).unwrap();
    fs::remove_file(&layout.spatial_path).unwrap();
    assert!(matches!(
        persist::load(&layout, toy_settings()),
        Err(SnapshotError::Missing(_))
    ));
}

#[test]
fn mapping_divergence_is_inconsistent_not_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    persist::save(&layout, &populated_index(6)).unwrap();

    // Drop one id from both mapping directions; the spatial artifact still
    // holds its vector, so the pair no longer agrees.
    let mut mapping: serde_json::Value =
        serde_json::from_slice(&fs::read(&layout.mapping_path).unwrap()).unwrap();
    mapping["internal_id_to_identity"]
        .as_object_mut()
        .unwrap()
        .remove("0");
    for (_, ids) in mapping["identity_to_internal_ids"].as_object_mut().unwrap() {
        let ids = ids.as_array_mut().unwrap();
        ids.retain(|v| v.as_u64() != Some(0));
    }
    fs::write(&layout.mapping_path, serde_json::to_vec(&mapping).unwrap()).unwrap();

    assert!(matches!(
        persist::load(&layout, toy_settings()),
        Err(SnapshotError::Inconsistent(_))
    ));
}

#[test]
fn corrupt_spatial_artifact_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    persist::save(&layout, &populated_index(8)).unwrap();

    let mut bytes = fs::read(&layout.spatial_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&layout.spatial_path, bytes).unwrap();

    assert!(matches!(
        persist::load(&layout, toy_settings()),
        Err(SnapshotError::Corrupt(_))
    ));
}

#[test]
fn remove_then_rebuild_roundtrips_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());

    let mut index = IdentityIndex::new(4, toy_settings());
    for i in 0..10u64 {
        index.insert(Identity(i % 2 + 1), ring_vector(i)).unwrap();
    }
    assert_eq!(index.count_identities(), 2);
    index.remove_identity(Identity(1)).unwrap();

    // The durable store no longer has Identity(1) either.
    let survivors: Vec<_> = (0..10u64)
        .filter(|i| i % 2 + 1 == 2)
        .map(|i| (Identity(2), ring_vector(i)))
        .collect();
    index.rebuild(survivors).unwrap();
    assert_eq!(index.count_identities(), 1);

    persist::save(&layout, &index).unwrap();
    let loaded = persist::load(&layout, toy_settings()).unwrap();
    assert_eq!(loaded.count_identities(), 1);
    assert_eq!(loaded.count_vectors(), 5);
    assert!(loaded
        .search(&ring_vector(1), 10)
        .unwrap()
        .iter()
        .all(|h| h.identity == Identity(2)));
}

#[test]
fn tombstones_survive_roundtrip_and_compact_reclaims() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());

    let mut index = populated_index(20);
    index.remove_identity(Identity(0)).unwrap();
    let tombstones = index.tombstone_count();
    assert!(tombstones > 0);
    persist::save(&layout, &index).unwrap();

    let mut loaded = persist::load(&layout, toy_settings()).unwrap();
    assert_eq!(loaded.tombstone_count(), tombstones);

    loaded.compact();
    assert_eq!(loaded.tombstone_count(), 0);
    persist::save(&layout, &loaded).unwrap();

    let reloaded = persist::load(&layout, toy_settings()).unwrap();
    assert_eq!(reloaded.tombstone_count(), 0);
    assert_eq!(reloaded.count_vectors(), loaded.count_vectors());
    let hits = reloaded.search(&ring_vector(3), 5).unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.identity != Identity(0)));
}

#[test]
fn overwriting_save_replaces_previous_pair() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SnapshotLayout::new(dir.path());
    persist::save(&layout, &populated_index(8)).unwrap();

    let mut smaller = IdentityIndex::new(4, toy_settings());
    smaller.insert(Identity(42), ring_vector(0)).unwrap();
    persist::save(&layout, &smaller).unwrap();

    let loaded = persist::load(&layout, toy_settings()).unwrap();
    assert_eq!(loaded.count_vectors(), 1);
    assert_eq!(loaded.count_identities(), 1);
}
