// In-memory collection backend (tests, embedding)
pub mod backend;
pub mod dataset;
pub mod plugins;
pub mod store;

// Re-exports
pub use backend::{
    Aggregation, ComputeFn, ErrorTransformFn, KeyFn, LocalBackend, ReduceFn, SinkFn,
    TransformFn, WindowFn,
};
pub use dataset::LocalDataset;
pub use plugins::{LocalPlugins, StaticJoiner};
pub use store::LocalStore;
