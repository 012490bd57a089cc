//! Randomized projection forest over unit vectors. Each tree recursively
//! splits the id set by the hyperplane between two randomly chosen members;
//! queries descend all trees by margin priority and pool the leaf candidates.
//! Recall is approximate: a true neighbor near a partition boundary can be
//! missed, but a candidate never appears that was not indexed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::InternalId;

const MAX_DEPTH: usize = 32;
const PLANE_PICK_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpForest {
    leaf_size: usize,
    trees: Vec<Node>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Node {
    Leaf(Vec<InternalId>),
    Split {
        plane: Vec<f32>,
        below: Box<Node>,
        above: Box<Node>,
    },
}

impl RpForest {
    pub fn empty(leaf_size: usize) -> Self {
        Self {
            leaf_size: leaf_size.max(2),
            trees: Vec::new(),
        }
    }

    /// Builds `tree_count` trees over the given vectors. Per-tree seeds are
    /// derived from `seed`, so the result is identical across runs and
    /// independent of rayon's scheduling.
    pub fn build(
        leaf_size: usize,
        tree_count: usize,
        seed: u64,
        vectors: &BTreeMap<InternalId, Vec<f32>>,
    ) -> Self {
        let leaf_size = leaf_size.max(2);
        let ids: Vec<InternalId> = vectors.keys().copied().collect();
        if ids.is_empty() {
            return Self::empty(leaf_size);
        }
        let trees = (0..tree_count.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                split(&ids, vectors, leaf_size, &mut rng, 0)
            })
            .collect();
        Self { leaf_size, trees }
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Every id reachable through the forest. Each tree partitions the full
    /// build-time id set, so walking one tree is enough.
    pub fn indexed_ids(&self) -> BTreeSet<InternalId> {
        let mut ids = BTreeSet::new();
        if let Some(tree) = self.trees.first() {
            collect_ids(tree, &mut ids);
        }
        ids
    }

    /// Returns at least `want` candidate ids (when that many exist under the
    /// visited leaves), sorted and deduplicated. May include stale ids that
    /// were removed after the forest was built; callers filter those through
    /// the forward map.
    pub fn query(&self, query: &[f32], want: usize) -> Vec<InternalId> {
        if self.trees.is_empty() || want == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<Visit<'_>> = self
            .trees
            .iter()
            .map(|tree| Visit {
                priority: f32::INFINITY,
                node: tree,
            })
            .collect();
        let mut candidates = Vec::new();
        while candidates.len() < want {
            let Some(visit) = heap.pop() else {
                break;
            };
            match visit.node {
                Node::Leaf(ids) => candidates.extend_from_slice(ids),
                Node::Split {
                    plane,
                    below,
                    above,
                } => {
                    let m = dot(plane, query);
                    let (near, far) = if m < 0.0 {
                        (below, above)
                    } else {
                        (above, below)
                    };
                    heap.push(Visit {
                        priority: visit.priority,
                        node: near,
                    });
                    heap.push(Visit {
                        priority: visit.priority.min(m.abs()),
                        node: far,
                    });
                }
            }
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }
}

struct Visit<'a> {
    priority: f32,
    node: &'a Node,
}

impl PartialEq for Visit<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority) == Ordering::Equal
    }
}

impl Eq for Visit<'_> {}

impl PartialOrd for Visit<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Visit<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

fn collect_ids(node: &Node, out: &mut BTreeSet<InternalId>) {
    match node {
        Node::Leaf(ids) => out.extend(ids.iter().copied()),
        Node::Split { below, above, .. } => {
            collect_ids(below, out);
            collect_ids(above, out);
        }
    }
}

pub(super) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn split(
    ids: &[InternalId],
    vectors: &BTreeMap<InternalId, Vec<f32>>,
    leaf_size: usize,
    rng: &mut StdRng,
    depth: usize,
) -> Node {
    if ids.len() <= leaf_size || depth >= MAX_DEPTH {
        return Node::Leaf(ids.to_vec());
    }
    let Some(plane) = pick_plane(ids, vectors, rng) else {
        return Node::Leaf(ids.to_vec());
    };
    let mut below = Vec::new();
    let mut above = Vec::new();
    for &id in ids {
        if let Some(v) = vectors.get(&id) {
            if dot(&plane, v) < 0.0 {
                below.push(id);
            } else {
                above.push(id);
            }
        }
    }
    if below.is_empty() || above.is_empty() {
        return Node::Leaf(ids.to_vec());
    }
    Node::Split {
        plane,
        below: Box::new(split(&below, vectors, leaf_size, rng, depth + 1)),
        above: Box::new(split(&above, vectors, leaf_size, rng, depth + 1)),
    }
}

fn pick_plane(
    ids: &[InternalId],
    vectors: &BTreeMap<InternalId, Vec<f32>>,
    rng: &mut StdRng,
) -> Option<Vec<f32>> {
    for _ in 0..PLANE_PICK_ATTEMPTS {
        let a = *ids.choose(rng)?;
        let b = *ids.choose(rng)?;
        if a == b {
            continue;
        }
        let (Some(va), Some(vb)) = (vectors.get(&a), vectors.get(&b)) else {
            continue;
        };
        let mut plane: Vec<f32> = va.iter().zip(vb.iter()).map(|(x, y)| x - y).collect();
        let norm = plane.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            continue;
        }
        for v in plane.iter_mut() {
            *v /= norm;
        }
        return Some(plane);
    }
    None
}
