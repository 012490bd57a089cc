#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: Option<String>,
    pub embedding_dim: usize,
    pub match_threshold: f32,
    pub default_top_k: usize,
    pub max_k: usize,
    pub forest_trees: usize,
    pub forest_leaf_size: usize,
    pub forest_seed: u64,
    pub search_oversample: usize,
    pub pending_rebuild_limit: usize,
    pub tombstone_rebuild_limit: usize,
    pub embed_attempts: usize,
    pub snapshot_save_attempts: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let match_threshold = resolve_f32("--match-threshold", "MATCH_THRESHOLD", 0.6);
        anyhow::ensure!(
            (0.0..=1.0).contains(&match_threshold),
            "MATCH_THRESHOLD must be within [0, 1]"
        );
        let max_k = resolve_usize("--max-k", "MAX_K", 256).max(1);
        let default_top_k = resolve_usize("--top-k", "TOP_K", 5).clamp(1, max_k);
        Ok(Self {
            data_dir: resolve_string("--data-dir", "DATA_DIR"),
            embedding_dim: resolve_usize("--embedding-dim", "EMBEDDING_DIM", 128).max(1),
            match_threshold,
            default_top_k,
            max_k,
            forest_trees: resolve_usize("--forest-trees", "FOREST_TREES", 10).max(1),
            forest_leaf_size: resolve_usize("--forest-leaf-size", "FOREST_LEAF_SIZE", 16).max(2),
            forest_seed: resolve_u64("--forest-seed", "FOREST_SEED", 0xFACE),
            search_oversample: resolve_usize("--search-oversample", "SEARCH_OVERSAMPLE", 4).max(1),
            pending_rebuild_limit: resolve_usize(
                "--pending-rebuild-limit",
                "PENDING_REBUILD_LIMIT",
                64,
            )
            .max(1),
            tombstone_rebuild_limit: resolve_usize(
                "--tombstone-rebuild-limit",
                "TOMBSTONE_REBUILD_LIMIT",
                256,
            ),
            embed_attempts: resolve_usize("--embed-attempts", "EMBED_ATTEMPTS", 2).max(1),
            snapshot_save_attempts: resolve_usize(
                "--snapshot-save-attempts",
                "SNAPSHOT_SAVE_ATTEMPTS",
                3,
            )
            .max(1),
        })
    }
}

// Helpers

fn cli_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn resolve_string(flag: &str, env: &str) -> Option<String> {
    if let Some(val) = cli_arg(flag) {
        return Some(val);
    }
    std::env::var(env).ok()
}

fn resolve_usize(flag: &str, env: &str, default: usize) -> usize {
    if let Some(val_str) = cli_arg(flag) {
        if let Ok(v) = val_str.parse::<usize>() {
            return v;
        }
    }
    if let Ok(val_str) = std::env::var(env) {
        if let Ok(v) = val_str.parse::<usize>() {
            return v;
        }
    }
    default
}

fn resolve_u64(flag: &str, env: &str, default: u64) -> u64 {
    if let Some(val_str) = cli_arg(flag) {
        if let Ok(v) = val_str.parse::<u64>() {
            return v;
        }
    }
    if let Ok(val_str) = std::env::var(env) {
        if let Ok(v) = val_str.parse::<u64>() {
            return v;
        }
    }
    default
}

fn resolve_f32(flag: &str, env: &str, default: f32) -> f32 {
    if let Some(val_str) = cli_arg(flag) {
        if let Ok(v) = val_str.parse::<f32>() {
            return v;
        }
    }
    if let Ok(val_str) = std::env::var(env) {
        if let Ok(v) = val_str.parse::<f32>() {
            return v;
        }
    }
    default
}
