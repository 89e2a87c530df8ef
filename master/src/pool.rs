use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("execution pool is closed")]
    Closed,
    #[error("stage worker panicked")]
    Panicked,
    #[error("blocking task was cancelled")]
    Cancelled,
}

/// Pool acotado de hilos bloqueantes para los workers de etapa.
///
/// Cada llamada toma un permiso antes de pasar a `spawn_blocking`; si no
/// hay permisos libres la llamada queda en cola (nunca falla por falta de
/// capacidad). El permiso viaja dentro del closure, así que una llamada
/// abandonada sigue ocupando su lugar hasta que realmente termina.
#[derive(Clone, Debug)]
pub struct ExecutionPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ExecutionPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots libres en este momento.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Ejecuta `f` en el pool. Si el future se descarta después de
    /// despachar, el trabajo sigue en segundo plano y su resultado se pierde.
    pub async fn run<F, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                PoolError::Panicked
            } else {
                PoolError::Cancelled
            }
        })
    }
}
