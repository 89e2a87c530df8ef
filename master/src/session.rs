use common::{TaskId, ABANDONED_MESSAGE};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::TaskHandle;

pub type SessionId = String;

struct ActiveRun {
    task: TaskHandle,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionSlot {
    active: Option<ActiveRun>,
}

/// Sesión de cliente -> corrida activa.
///
/// Cada sesión tiene su propio lock: `acquire` lo toma y lo retiene hasta
/// `register`, así dos uploads de la misma sesión nunca se intercalan.
/// Sesiones distintas no se bloquean entre sí.
#[derive(Clone, Default)]
pub struct SessionManager {
    slots: Arc<Mutex<HashMap<SessionId, Arc<AsyncMutex<SessionSlot>>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> SessionLease {
        let (slot, is_new) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(session_id) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(AsyncMutex::new(SessionSlot::default()));
                    slots.insert(session_id.to_string(), slot.clone());
                    (slot, true)
                }
            }
        };

        SessionLease {
            session_id: session_id.to_string(),
            is_new,
            slot: slot.lock_owned().await,
        }
    }

    /// Libera la sesión al terminar una corrida, sólo si sigue apuntando a
    /// esa corrida (otra más nueva pudo haberla reemplazado).
    pub async fn release(&self, session_id: &str, task_id: &str) {
        let Some(slot) = self.slot(session_id) else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.active.as_ref().is_some_and(|run| run.task.id() == task_id) {
            slot.active = None;
        }
    }

    pub async fn active_task(&self, session_id: &str) -> Option<TaskId> {
        let slot = self.slot(session_id)?;
        let slot = slot.lock().await;
        slot.active.as_ref().map(|run| run.task.id().to_string())
    }

    pub fn session_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, session_id: &str) -> Option<Arc<AsyncMutex<SessionSlot>>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }
}

/// Acceso exclusivo a una sesión entre `acquire` y `register`.
pub struct SessionLease {
    session_id: SessionId,
    is_new: bool,
    slot: OwnedMutexGuard<SessionSlot>,
}

impl SessionLease {
    pub fn is_new_session(&self) -> bool {
        self.is_new
    }

    /// Corrida activa que sería reemplazada, si hay una.
    pub fn predecessor(&self) -> Option<&str> {
        self.slot.active.as_ref().map(|run| run.task.id())
    }

    /// Cancela la corrida anterior y la deja en `Abandoned` si todavía no
    /// había terminado. Devuelve su id en ese caso.
    pub fn preempt(&mut self) -> Option<TaskId> {
        let run = self.slot.active.take()?;
        if run.task.status().map_or(true, |s| s.is_terminal()) {
            return None;
        }

        run.cancel.cancel();
        run.task.abandon(ABANDONED_MESSAGE);
        info!(
            "cancelando tarea anterior {} de la sesión {}",
            run.task.id(),
            self.session_id
        );
        Some(run.task.id().to_string())
    }

    /// Marca `task` como la corrida activa de la sesión y libera el lock.
    pub fn register(mut self, task: TaskHandle, cancel: CancellationToken) {
        self.preempt();
        self.slot.active = Some(ActiveRun { task, cancel });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskRegistry;
    use common::TaskStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn primera_sesion_es_nueva_y_sin_predecesor() {
        let sessions = SessionManager::new();
        let lease = sessions.acquire("s1").await;
        assert!(lease.is_new_session());
        assert!(lease.predecessor().is_none());
        drop(lease);

        let lease = sessions.acquire("s1").await;
        assert!(!lease.is_new_session());
        assert_eq!(sessions.session_count(), 1);
    }

    #[tokio::test]
    async fn nueva_corrida_abandona_la_anterior_antes_de_crearse() {
        let registry = TaskRegistry::new();
        let sessions = SessionManager::new();

        let first = registry.create(vec!["A".to_string()]);
        let first_cancel = CancellationToken::new();
        sessions
            .acquire("s1")
            .await
            .register(first.clone(), first_cancel.clone());

        let mut lease = sessions.acquire("s1").await;
        assert_eq!(lease.predecessor(), Some(first.id()));
        assert_eq!(lease.preempt().as_deref(), Some(first.id()));

        // A ya está abandonada antes de que exista B
        assert!(first_cancel.is_cancelled());
        let a = registry.get(first.id()).unwrap();
        assert_eq!(a.status, TaskStatus::Abandoned);
        assert_eq!(a.error.as_deref(), Some(ABANDONED_MESSAGE));

        let second = registry.create(vec!["A".to_string()]);
        lease.register(second.clone(), CancellationToken::new());
        assert_eq!(sessions.active_task("s1").await.as_deref(), Some(second.id()));
    }

    #[tokio::test]
    async fn predecesor_terminado_no_se_cancela() {
        let registry = TaskRegistry::new();
        let sessions = SessionManager::new();

        let done = registry.create(vec![]);
        let cancel = CancellationToken::new();
        sessions.acquire("s1").await.register(done.clone(), cancel.clone());
        done.fail("boom");

        let mut lease = sessions.acquire("s1").await;
        assert!(lease.preempt().is_none());
        assert!(!cancel.is_cancelled());
        assert_eq!(registry.get(done.id()).unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn release_solo_limpia_si_es_la_corrida_activa() {
        let registry = TaskRegistry::new();
        let sessions = SessionManager::new();

        let a = registry.create(vec![]);
        let b = registry.create(vec![]);
        sessions.acquire("s1").await.register(b.clone(), CancellationToken::new());

        sessions.release("s1", a.id()).await;
        assert_eq!(sessions.active_task("s1").await.as_deref(), Some(b.id()));

        sessions.release("s1", b.id()).await;
        assert!(sessions.active_task("s1").await.is_none());
        // la sesión sigue existiendo
        assert_eq!(sessions.session_count(), 1);
    }

    #[tokio::test]
    async fn leases_de_la_misma_sesion_se_serializan() {
        let sessions = SessionManager::new();
        let lease = sessions.acquire("s1").await;

        let other = sessions.clone();
        let waiting = tokio::spawn(async move { other.acquire("s1").await.is_new_session() });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        // otra sesión no espera
        let unrelated = tokio::time::timeout(Duration::from_millis(50), sessions.acquire("s2")).await;
        assert!(unrelated.is_ok());

        drop(lease);
        assert!(!waiting.await.unwrap());
    }
}
