use visage::embedding::l2_normalize;
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

fn toy_index() -> IdentityIndex {
    IdentityIndex::new(4, toy_settings())
}

fn ring_vector(i: u64) -> Vec<f32> {
    let angle = i as f32 * 0.31;
    l2_normalize(vec![angle.cos(), angle.sin(), 0.2, 0.1])
}

#[test]
fn exact_query_returns_identity_at_distance_zero() {
    let mut index = toy_index();
    index
        .insert(Identity(1), vec![1.0, 0.0, 0.0, 0.0])
        .unwrap();
    let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].identity, Identity(1));
    assert!(hits[0].distance.abs() < 1e-6);
}

#[test]
fn nearer_identity_ranks_first() {
    let mut index = toy_index();
    index
        .insert(Identity(1), vec![1.0, 0.0, 0.0, 0.0])
        .unwrap();
    index
        .insert(Identity(2), vec![0.0, 1.0, 0.0, 0.0])
        .unwrap();
    let query = l2_normalize(vec![0.9, 0.1, 0.0, 0.0]);
    let hits = index.search(&query, 2).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].identity, Identity(1));
    assert_eq!(hits[1].identity, Identity(2));
    assert!(hits[0].distance < hits[1].distance);
}

#[test]
fn empty_index_returns_empty_list() {
    let index = toy_index();
    assert!(index.search(&[0.5, 0.5, 0.5, 0.5], 10).unwrap().is_empty());
}

#[test]
fn scaled_duplicates_are_both_stored() {
    // Dedup is only by capture fingerprint, never by vector equality.
    let mut index = toy_index();
    index
        .insert(Identity(1), l2_normalize(vec![1.0, 0.0, 0.0, 0.0]))
        .unwrap();
    index
        .insert(Identity(1), l2_normalize(vec![2.5, 0.0, 0.0, 0.0]))
        .unwrap();
    assert_eq!(index.count_vectors(), 2);
    assert_eq!(index.count_identities(), 1);
    let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].distance.abs() < 1e-6);
    assert!(hits[1].distance.abs() < 1e-6);
    assert!(hits[0].internal_id < hits[1].internal_id);
}

#[test]
fn repeated_search_is_deterministic() {
    let mut index = toy_index();
    for i in 0..50u64 {
        index.insert(Identity(i % 12), ring_vector(i)).unwrap();
    }
    let query = ring_vector(101);
    let first = index.search(&query, 8).unwrap();
    assert!(!first.is_empty());
    for _ in 0..5 {
        assert_eq!(index.search(&query, 8).unwrap(), first);
    }
}

#[test]
fn removed_identity_never_surfaces() {
    // tombstone_rebuild_limit = 0: stale entries stay in the forest, so this
    // exercises the forward-map filter rather than physical reclamation.
    let mut index = toy_index();
    let target = l2_normalize(vec![0.3, 0.3, 0.9, 0.1]);
    index.insert(Identity(1), target.clone()).unwrap();
    for i in 0..20u64 {
        index.insert(Identity(2 + i % 3), ring_vector(i)).unwrap();
    }
    index.remove_identity(Identity(1)).unwrap();
    assert!(index.tombstone_count() > 0, "expected a stale forest entry");

    let hits = index.search(&target, 20).unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.identity != Identity(1)));
    for i in 0..10u64 {
        let hits = index.search(&ring_vector(i * 13), 20).unwrap();
        assert!(hits.iter().all(|h| h.identity != Identity(1)));
    }
}

#[test]
fn remove_unknown_identity_is_an_error() {
    let mut index = toy_index();
    assert!(index.remove_identity(Identity(404)).is_err());
}

#[test]
fn rebuild_replaces_state_and_clears_tombstones() {
    let mut index = toy_index();
    for i in 0..12u64 {
        index.insert(Identity(i), ring_vector(i)).unwrap();
    }
    index.remove_identity(Identity(0)).unwrap();
    assert!(index.tombstone_count() > 0);

    let survivors: Vec<_> = (1..12u64).map(|i| (Identity(i), ring_vector(i))).collect();
    index.rebuild(survivors).unwrap();
    assert_eq!(index.count_identities(), 11);
    assert_eq!(index.count_vectors(), 11);
    assert_eq!(index.tombstone_count(), 0);
    assert!(index.is_consistent());

    let hits = index.search(&ring_vector(5), 1).unwrap();
    assert_eq!(hits[0].identity, Identity(5));
}

#[test]
fn k_larger_than_population_returns_everything() {
    let mut index = toy_index();
    for i in 0..6u64 {
        index.insert(Identity(i), ring_vector(i)).unwrap();
    }
    let hits = index.search(&ring_vector(0), 100).unwrap();
    assert_eq!(hits.len(), 6);
    for pair in hits.windows(2) {
        assert!(pair[0].distance <= pair[1].distance + 1e-6);
    }
}

#[test]
fn counts_track_mutations() {
    let mut index = toy_index();
    index.insert(Identity(1), ring_vector(0)).unwrap();
    index.insert(Identity(1), ring_vector(1)).unwrap();
    index.insert(Identity(2), ring_vector(2)).unwrap();
    assert_eq!(index.count_identities(), 2);
    assert_eq!(index.count_vectors(), 3);
    let removed = index.remove_identity(Identity(1)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(index.count_identities(), 1);
    assert_eq!(index.count_vectors(), 1);
}
