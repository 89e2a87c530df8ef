// master/src/state.rs

use std::sync::{atomic::AtomicBool, Arc};

use crate::pipeline::PipelineController;
use crate::registry::TaskRegistry;
use crate::session::SessionManager;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: TaskRegistry,
    pub sessions: SessionManager,
    pub controller: Arc<PipelineController>,
    pub store: Arc<dyn RecordStore>,
    // lo prende el warmup cuando terminó de cargar modelos
    pub models_ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(controller: Arc<PipelineController>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            registry: TaskRegistry::new(),
            sessions: SessionManager::new(),
            controller,
            store,
            models_ready: Arc::new(AtomicBool::new(false)),
        }
    }
}
