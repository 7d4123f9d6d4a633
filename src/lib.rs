pub mod checkpoint;
pub mod error;
pub mod extract;
pub mod models;
pub mod pickle_vm;
pub mod writer;

pub use checkpoint::Checkpoint;
pub use error::Error;
pub use extract::extract;
pub use models::{DType, Tensor, TensorMap, TrainingInfo, Variant};
pub use pickle_vm::{Callable, StorageRef, TensorRef, Value};
pub use writer::ArchiveWriter;
