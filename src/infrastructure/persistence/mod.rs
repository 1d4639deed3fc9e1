pub mod checkpoint;

pub use checkpoint::{CheckpointManifest, CheckpointStore};
