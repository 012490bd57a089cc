//! Face-embedding identity search: approximate nearest-neighbor index over
//! L2-normalized embeddings with durable snapshots.

pub mod config;
pub mod embedding;
pub mod index;
pub mod model;
pub mod service;
pub mod store;
