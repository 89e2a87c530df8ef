use chrono::{DateTime, Utc};
use common::{StageOutput, TaskId, TaskRecord, TaskResult, TaskStatus};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio_util::sync::CancellationToken;

/// Registro concurrente `task_id -> TaskRecord`.
///
/// Las lecturas devuelven una copia completa del registro. Toda mutación de
/// una tarea pasa por su [`TaskHandle`] y se aplica bajo el mismo lock, así
/// que un snapshot nunca ve un paso completado sin sus resultados parciales.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<TaskId, TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, declared_steps: Vec<String>) -> TaskHandle {
        let task_id = uuid::Uuid::new_v4().to_string();
        let record = TaskRecord::new(task_id.clone(), declared_steps);
        self.lock().insert(task_id.clone(), record);

        TaskHandle {
            task_id,
            registry: self.clone(),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Elimina los registros terminales que terminaron antes de `cutoff`.
    /// Las corridas en curso nunca se tocan.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, record| match record.finished_at {
            Some(finished) if record.is_terminal() => finished >= cutoff,
            _ => true,
        });
        before - tasks.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskRecord>> {
        // un panic en otro hilo no invalida los registros
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Acceso de escritura a una tarea. Sólo lo tienen el controlador, el
/// runner y el gestor de sesiones (para abandonarla).
#[derive(Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    registry: TaskRegistry,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.registry
            .lock()
            .get(&self.task_id)
            .map(|record| record.status)
    }

    pub fn enter(&self, status: TaskStatus, step: Option<&str>, progress: u8) -> bool {
        self.update(|r| r.enter(status, step, progress))
    }

    pub fn bump_progress(&self, progress: u8) -> bool {
        self.update(|r| r.bump_progress(progress))
    }

    pub fn complete_step(&self, step: &str, partial: &StageOutput) -> bool {
        self.update(|r| r.complete_step(step, partial))
    }

    pub fn time_out_step(&self, step: &str, fallback: Option<&StageOutput>) -> bool {
        self.update(|r| r.time_out_step(step, fallback))
    }

    pub fn complete(&self, result: TaskResult) -> bool {
        self.update(|r| r.complete(result))
    }

    pub fn fail(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(|r| r.fail(error))
    }

    pub fn abandon(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.update(|r| r.abandon(reason))
    }

    /// Punto de commit de la corrida: `write` persiste el resultado y la
    /// tarea pasa a `Complete` dentro de la misma sección crítica que usan
    /// `fail` y `abandon`. Si la tarea ya terminó o `cancel` está activo,
    /// `write` no se ejecuta y se devuelve `Ok(None)`.
    pub fn commit<E>(
        &self,
        step: &str,
        cancel: &CancellationToken,
        write: impl FnOnce() -> Result<TaskResult, E>,
    ) -> Result<Option<String>, E> {
        let mut tasks = self.registry.lock();
        let Some(record) = tasks.get_mut(&self.task_id) else {
            return Ok(None);
        };
        if record.is_terminal() || cancel.is_cancelled() {
            return Ok(None);
        }

        let result = write()?;
        let id = result.id.clone();
        record.complete_step(step, &StageOutput::new());
        record.complete(result);
        Ok(Some(id))
    }

    fn update(&self, f: impl FnOnce(&mut TaskRecord) -> bool) -> bool {
        let mut tasks = self.registry.lock();
        match tasks.get_mut(&self.task_id) {
            Some(record) => f(record),
            None => false,
        }
    }
}
