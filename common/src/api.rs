use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/* --------- Payloads HTTP --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelsStatus {
    Loading,
    Ready,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyModelsResponse {
    pub status: ModelsStatus,
}

/// Cuerpo de error de la API: `{"detail": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Nombre de la cookie que identifica la sesión del cliente.
pub const SESSION_COOKIE: &str = "session_id";
