pub mod api;
pub mod results;
pub mod stage;
pub mod task;

pub use api::{ErrorBody, ModelsStatus, ReadyModelsResponse, UploadResponse, SESSION_COOKIE};
pub use results::{AggregateStats, StoredRecord};
pub use stage::{
    Artifact, ClusterWorker, Phase, PreparedArtifact, StageDescriptor, StageError, StageOutput,
    StageValue, StageWorker, SynthesisWorker,
};
pub use task::{TaskId, TaskRecord, TaskResult, TaskStatus, ABANDONED_MESSAGE};
