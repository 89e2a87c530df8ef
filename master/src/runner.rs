use common::{StageDescriptor, StageError, StageValue, StageWorker};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pool::{ExecutionPool, PoolError};
use crate::registry::TaskHandle;

/// Resultado de correr una etapa. Nunca se propaga como error: el
/// controlador decide qué hacer con cada variante.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Success(T),
    /// Excedió su presupuesto; la llamada quedó abandonada.
    TimedOut,
    Failed(StageError),
    Cancelled,
}

impl<T> StageOutcome<T> {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Success(_) => "success",
            StageOutcome::TimedOut => "timed_out",
            StageOutcome::Failed(_) => "failed",
            StageOutcome::Cancelled => "cancelled",
        }
    }
}

/// Corre una etapa en el pool con su propio deadline y registra el efecto
/// en la tarea.
#[derive(Clone, Debug)]
pub struct StageRunner {
    pool: ExecutionPool,
}

impl StageRunner {
    pub fn new(pool: ExecutionPool) -> Self {
        Self { pool }
    }

    /// El deadline corre desde el despacho (incluye la espera por un slot
    /// del pool). Orden de desempate en un mismo instante: cancelación,
    /// resultado ya disponible, timeout.
    pub async fn run<W>(
        &self,
        stage: &StageDescriptor,
        worker: Arc<W>,
        input: Arc<W::Input>,
        task: &TaskHandle,
        cancel: &CancellationToken,
    ) -> StageOutcome<W::Output>
    where
        W: StageWorker + ?Sized,
    {
        let started = Instant::now();
        debug!(task_id = task.id(), stage = %stage.name, "despachando etapa");

        let work = self.pool.run(move || worker.run(&input));
        tokio::pin!(work);
        let deadline = tokio::time::sleep(stage.timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => StageOutcome::Cancelled,
            res = &mut work => match res {
                Ok(Ok(value)) => StageOutcome::Success(value),
                Ok(Err(e)) => StageOutcome::Failed(e),
                Err(PoolError::Panicked) => StageOutcome::Failed(StageError::Panicked),
                Err(e) => StageOutcome::Failed(StageError::failed(e.to_string())),
            },
            _ = &mut deadline => StageOutcome::TimedOut,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            StageOutcome::Success(value) => {
                task.complete_step(&stage.name, &value.to_partial());
                info!(task_id = task.id(), stage = %stage.name, elapsed_ms, "etapa completada");
            }
            StageOutcome::TimedOut => {
                warn!(
                    task_id = task.id(),
                    stage = %stage.name,
                    budget_ms = stage.timeout.as_millis() as u64,
                    "etapa excedió su presupuesto, se abandona"
                );
                task.time_out_step(&stage.name, stage.fallback.as_ref());
            }
            StageOutcome::Failed(e) if stage.fatal_on_error => {
                error!(task_id = task.id(), stage = %stage.name, elapsed_ms, "etapa falló: {}", e);
            }
            StageOutcome::Failed(e) => {
                // no fatal: se degrada igual que un timeout
                warn!(task_id = task.id(), stage = %stage.name, "etapa falló, se usa el fallback: {}", e);
                task.time_out_step(&stage.name, stage.fallback.as_ref());
            }
            StageOutcome::Cancelled => {
                info!(task_id = task.id(), stage = %stage.name, "etapa cancelada");
            }
        }

        outcome
    }
}
