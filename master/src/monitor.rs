use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

use crate::registry::TaskRegistry;

/// Loop de retención: cada `interval` saca del registro las tareas
/// terminales que terminaron hace más de `retention`.
pub async fn sweep_finished_tasks(registry: TaskRegistry, retention: Duration, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        sweep_once(&registry, retention);
    }
}

/// Una pasada. Devuelve cuántas tareas se eliminaron.
pub fn sweep_once(registry: &TaskRegistry, retention: Duration) -> usize {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let evicted = registry.evict_finished_before(cutoff);
    if evicted > 0 {
        info!("retención: {} tareas terminadas eliminadas, quedan {}", evicted, registry.len());
    } else {
        debug!("retención: nada para eliminar ({} tareas)", registry.len());
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_se_eliminan_las_terminales_viejas() {
        let registry = TaskRegistry::new();
        let done = registry.create(vec!["A".to_string()]);
        let running = registry.create(vec!["A".to_string()]);
        done.fail("boom");

        // retención enorme: nada vence
        assert_eq!(sweep_once(&registry, Duration::from_secs(3600)), 0);
        assert_eq!(registry.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sweep_once(&registry, Duration::from_millis(5)), 1);
        assert!(registry.get(done.id()).is_none());
        assert!(registry.get(running.id()).is_some());
    }

    #[tokio::test]
    async fn el_loop_barre_periodicamente() {
        let registry = TaskRegistry::new();
        registry.create(vec![]).abandon("x");

        let handle = tokio::spawn(sweep_finished_tasks(
            registry.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert_eq!(registry.len(), 0);
    }
}
