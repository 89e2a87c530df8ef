use common::{
    Artifact, ClusterWorker, PreparedArtifact, StageDescriptor, StageValue, StageWorker,
    SynthesisWorker, TaskResult, TaskStatus, ABANDONED_MESSAGE,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::TaskHandle;
use crate::runner::{StageOutcome, StageRunner};
use crate::store::{PersistRequest, SavedRecord};

pub type InitWorker = dyn StageWorker<Input = Artifact, Output = PreparedArtifact>;
pub type FinalizeWorker = dyn StageWorker<Input = PersistRequest, Output = SavedRecord>;

/// Una etapa concreta: su configuración más el worker que la ejecuta.
pub struct Stage<W: ?Sized> {
    pub descriptor: StageDescriptor,
    pub worker: Arc<W>,
}

impl<W: ?Sized> Stage<W> {
    pub fn new(descriptor: StageDescriptor, worker: Arc<W>) -> Self {
        Self { descriptor, worker }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl<W: ?Sized> Clone for Stage<W> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            worker: Arc::clone(&self.worker),
        }
    }
}

/// Pipeline Init -> Cluster -> Synthesis -> Finalize.
#[derive(Clone)]
pub struct Pipeline {
    pub init: Stage<InitWorker>,
    pub cluster: Vec<Stage<ClusterWorker>>,
    pub synthesis: Vec<Stage<SynthesisWorker>>,
    pub finalize: Stage<FinalizeWorker>,
}

impl Pipeline {
    /// Nombres de todas las etapas en orden de ejecución.
    pub fn declared_steps(&self) -> Vec<String> {
        std::iter::once(self.init.name())
            .chain(self.cluster.iter().map(Stage::name))
            .chain(self.synthesis.iter().map(Stage::name))
            .chain(std::iter::once(self.finalize.name()))
            .map(str::to_string)
            .collect()
    }
}

/// Por qué se cortó una corrida antes de completar.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Abort {
    Cancelled,
    Failed(String),
}

pub struct PipelineController {
    pipeline: Pipeline,
    runner: StageRunner,
}

impl PipelineController {
    pub fn new(pipeline: Pipeline, runner: StageRunner) -> Self {
        Self { pipeline, runner }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    pub fn declared_steps(&self) -> Vec<String> {
        self.pipeline.declared_steps()
    }

    /// Ejecuta una corrida completa y lleva la tarea a un estado terminal.
    /// Devuelve el estado final que quedó en el registro.
    pub async fn run(&self, task: &TaskHandle, artifact: Artifact, cancel: &CancellationToken) -> TaskStatus {
        let decided = match self.drive(task, artifact, cancel).await {
            Ok(result) => {
                info!(task_id = task.id(), record_id = %result.id, "corrida completa");
                task.complete(result);
                TaskStatus::Complete
            }
            // un fallo visto después de cancelar cuenta como abandono
            Err(Abort::Failed(msg)) if !cancel.is_cancelled() => {
                warn!(task_id = task.id(), "corrida con error: {}", msg);
                task.fail(msg);
                TaskStatus::Error
            }
            Err(_) => {
                info!(task_id = task.id(), "corrida abandonada");
                task.abandon(ABANDONED_MESSAGE);
                TaskStatus::Abandoned
            }
        };
        task.status().unwrap_or(decided)
    }

    async fn drive(
        &self,
        task: &TaskHandle,
        artifact: Artifact,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, Abort> {
        let filename = artifact.filename.clone();

        /* ---------- Init ---------- */
        checkpoint(cancel)?;
        let init = &self.pipeline.init;
        task.enter(TaskStatus::Preprocessing, Some(init.name()), 5);
        let outcome = self
            .runner
            .run(&init.descriptor, init.worker.clone(), Arc::new(artifact), task, cancel)
            .await;
        let prepared = Arc::new(settle(init.name(), outcome)?);
        task.bump_progress(10);

        /* ---------- Cluster ---------- */
        checkpoint(cancel)?;
        task.enter(TaskStatus::ParallelAnalysis, Some(TaskStatus::ParallelAnalysis.label()), 10);
        let outcomes = join_all(self.pipeline.cluster.iter().map(|stage| {
            self.runner.run(
                &stage.descriptor,
                stage.worker.clone(),
                prepared.clone(),
                task,
                cancel,
            )
        }))
        .await;
        checkpoint(cancel)?;

        let mut merged = prepared.to_partial();
        for (stage, outcome) in self.pipeline.cluster.iter().zip(outcomes) {
            match outcome {
                StageOutcome::Success(out) => merged.extend(out),
                StageOutcome::Cancelled => return Err(Abort::Cancelled),
                StageOutcome::Failed(e) if stage.descriptor.fatal_on_error => {
                    return Err(Abort::Failed(e.to_string()));
                }
                StageOutcome::TimedOut | StageOutcome::Failed(_) => match &stage.descriptor.fallback {
                    Some(fallback) => merged.extend(fallback.clone()),
                    None => return Err(Abort::Failed(format!("{} timed out", stage.name()))),
                },
            }
        }
        task.bump_progress(85);

        /* ---------- Synthesis ---------- */
        for stage in &self.pipeline.synthesis {
            checkpoint(cancel)?;
            task.enter(TaskStatus::Synthesis, Some(stage.name()), 90);
            let input = Arc::new(merged.clone());
            let outcome = self
                .runner
                .run(&stage.descriptor, stage.worker.clone(), input, task, cancel)
                .await;
            merged.extend(settle(stage.name(), outcome)?);
        }
        task.bump_progress(98);

        /* ---------- Finalize ---------- */
        // la escritura se confirma contra la tarea y el token (ver TaskHandle::commit)
        checkpoint(cancel)?;
        let fin = &self.pipeline.finalize;
        task.enter(TaskStatus::Finalizing, Some(fin.name()), 98);
        let request = PersistRequest {
            task: task.clone(),
            step: fin.name().to_string(),
            cancel: cancel.clone(),
            filename,
            url: None,
            stats: merged.clone(),
        };
        let outcome = self
            .runner
            .run(&fin.descriptor, fin.worker.clone(), Arc::new(request), task, cancel)
            .await;
        let saved = settle(fin.name(), outcome)?;

        Ok(TaskResult {
            id: saved.id,
            url: None,
            stats: merged,
        })
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), Abort> {
    if cancel.is_cancelled() {
        Err(Abort::Cancelled)
    } else {
        Ok(())
    }
}

/// Etapas secuenciales: cualquier cosa distinta de `Success` corta la corrida.
fn settle<T>(name: &str, outcome: StageOutcome<T>) -> Result<T, Abort> {
    match outcome {
        StageOutcome::Success(value) => Ok(value),
        StageOutcome::TimedOut => Err(Abort::Failed(format!("{name} timed out"))),
        StageOutcome::Failed(e) => Err(Abort::Failed(e.to_string())),
        StageOutcome::Cancelled => Err(Abort::Cancelled),
    }
}
