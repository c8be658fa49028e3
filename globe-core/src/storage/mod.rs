pub mod checkpoint_store;
pub mod file_store;

pub use checkpoint_store::CheckpointStore;
pub use file_store::FileStore;
