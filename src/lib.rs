/// nbkit library crate.
///
/// Helpers used next to model-training notebooks: parameter breakdowns,
/// checkpoint key cleanup, JSONL loading, and dataset column normalization.
///
/// The binary entry point (src/main.rs) and the Python bindings in
/// `nbkit-py` use these same modules.
pub mod checkpoint;
pub mod columns;
pub mod jsonl;
pub mod params;
pub mod safetensors;
pub mod sources;
pub mod utils;

pub use params::{
    Breakdown, Category, ParamRecord, ParameterCount, ParameterSource, StorageId, count_parameters,
};
