use common::StageWorker;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{info, warn};

use crate::pipeline::{Pipeline, Stage};
use crate::pool::ExecutionPool;

/// Precarga los modelos de todas las etapas en el pool, en orden, y al
/// final marca el servicio como listo. Un fallo se loguea y no bloquea.
pub async fn warm_models(pipeline: Pipeline, pool: ExecutionPool, ready: Arc<AtomicBool>) -> usize {
    let started = Instant::now();
    let mut failures = 0;

    failures += warm_stage(&pool, &pipeline.init).await as usize;
    for stage in &pipeline.cluster {
        failures += warm_stage(&pool, stage).await as usize;
    }
    for stage in &pipeline.synthesis {
        failures += warm_stage(&pool, stage).await as usize;
    }
    failures += warm_stage(&pool, &pipeline.finalize).await as usize;

    ready.store(true, Ordering::SeqCst);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        failures, "modelos listos"
    );
    failures
}

/// Devuelve `true` si el warmup falló.
async fn warm_stage<W: StageWorker + ?Sized>(pool: &ExecutionPool, stage: &Stage<W>) -> bool {
    let worker = stage.worker.clone();
    match pool.run(move || worker.warmup()).await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            warn!(stage = %stage.name(), "warmup falló: {}", e);
            true
        }
        Err(e) => {
            warn!(stage = %stage.name(), "warmup no pudo correr: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testkit::Kit;
    use crate::pipeline::FinalizeWorker;
    use crate::store::{PersistRequest, SavedRecord};
    use common::{Phase, StageDescriptor, StageError};
    use std::time::Duration;

    struct BrokenModel;

    impl StageWorker for BrokenModel {
        type Input = PersistRequest;
        type Output = SavedRecord;

        fn run(&self, _: &PersistRequest) -> Result<SavedRecord, StageError> {
            Err(StageError::failed("sin modelo"))
        }

        fn warmup(&self) -> Result<(), StageError> {
            Err(StageError::failed("pesos no encontrados"))
        }
    }

    #[tokio::test]
    async fn marca_listo_al_terminar() {
        let built = Kit::happy().build();
        let ready = Arc::new(AtomicBool::new(false));

        let failures = warm_models(
            built.controller.pipeline().clone(),
            ExecutionPool::new(2),
            ready.clone(),
        )
        .await;

        assert_eq!(failures, 0);
        assert!(ready.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn un_fallo_no_bloquea_la_disponibilidad() {
        let built = Kit::happy().build();
        let mut pipeline = built.controller.pipeline().clone();
        let broken: Arc<FinalizeWorker> = Arc::new(BrokenModel);
        pipeline.finalize = Stage::new(
            StageDescriptor::new("Saving to Database", Phase::Finalize, Duration::from_secs(1)),
            broken,
        );
        let ready = Arc::new(AtomicBool::new(false));

        let failures = warm_models(pipeline, ExecutionPool::new(1), ready.clone()).await;
        assert_eq!(failures, 1);
        assert!(ready.load(Ordering::SeqCst));
    }
}
