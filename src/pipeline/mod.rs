// Data pipeline: ingestion, processing, storage and the step graph

pub mod graph;
pub mod ingestion;
pub mod load;
pub mod materialize;
pub mod processing;
pub mod resources;
pub mod storage;

// Re-export key types for the binary and integration tests
pub use graph::{Schedule, Step, SCHEDULES};
pub use materialize::{Materializer, RunReport, StepRun, UpstreamPolicy};
pub use resources::{PipelineContext, StoreFactory};
