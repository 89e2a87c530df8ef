use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    AggregateStats, Artifact, ModelsStatus, ReadyModelsResponse, TaskRecord, UploadResponse,
    SESSION_COOKIE,
};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/progress/:task_id", get(progress))
        .route("/stats", get(stats))
        .route("/ready_models", get(ready_models))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Recibe la imagen, reemplaza la corrida anterior de la sesión y lanza una nueva
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let artifact = read_image_field(multipart).await?;

    let (session_id, is_new_cookie) = match session_from_cookies(&headers) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    // el lease serializa uploads de la misma sesión hasta `register`
    let mut lease = state.sessions.acquire(&session_id).await;
    if let Some(old) = lease.preempt() {
        info!("tarea {} reemplazada en la sesión {}", old, session_id);
    }

    let task = state.registry.create(state.controller.declared_steps());
    let cancel = CancellationToken::new();
    let task_id = task.id().to_string();
    info!(
        task_id = %task_id,
        session = %session_id,
        file = %artifact.filename,
        bytes = artifact.bytes.len(),
        "nueva corrida"
    );

    {
        let controller = state.controller.clone();
        let sessions = state.sessions.clone();
        let task = task.clone();
        let cancel = cancel.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            controller.run(&task, artifact, &cancel).await;
            sessions.release(&session_id, task.id()).await;
        });
    }
    lease.register(task, cancel);

    let mut resp = Json(UploadResponse { task_id }).into_response();
    if is_new_cookie {
        let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly");
        let value = HeaderValue::from_str(&cookie).map_err(|e| ApiError::Internal(e.to_string()))?;
        resp.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(resp)
}

async fn progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    state
        .registry
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))
}

async fn stats(State(state): State<AppState>) -> Result<Json<AggregateStats>, ApiError> {
    let store = state.store.clone();
    let agg = tokio::task::spawn_blocking(move || store.aggregate())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(agg))
}

async fn ready_models(State(state): State<AppState>) -> Json<ReadyModelsResponse> {
    let status = if state.models_ready.load(Ordering::SeqCst) {
        ModelsStatus::Ready
    } else {
        ModelsStatus::Loading
    };
    Json(ReadyModelsResponse { status })
}

/* ---------------- helpers ---------------- */

async fn read_image_field(mut multipart: Multipart) -> Result<Artifact, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        if !content_type.starts_with("image/") {
            return Err(ApiError::Validation("File must be an image".to_string()));
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        return Ok(Artifact {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    Err(ApiError::Validation("Missing file field".to_string()))
}

fn session_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_pipeline;
    use crate::config::Settings;
    use crate::pipeline::{testkit::Kit, PipelineController};
    use crate::pool::ExecutionPool;
    use crate::runner::StageRunner;
    use crate::store::{MemoryStore, RecordStore};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::TaskStatus;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    const LIMIT: usize = 25 * 1024 * 1024;

    fn real_app() -> (Router, AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let record_store: Arc<dyn RecordStore> = store.clone();
        let pipeline = default_pipeline(&Settings::default(), record_store.clone());
        let controller = Arc::new(PipelineController::new(
            pipeline,
            StageRunner::new(ExecutionPool::new(4)),
        ));
        let state = AppState::new(controller, record_store);
        (build_router(state.clone(), LIMIT), state, store)
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 5) as u8, (y * 2) as u8, 128]));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn upload_request(content_type: &str, bytes: &[u8], cookie: Option<&str>) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"cuadro.png\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let mut req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"));
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        req.body(Body::from(body)).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_uri(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn upload_ok(app: &Router, bytes: &[u8], cookie: Option<&str>) -> (String, Option<String>) {
        let resp = app
            .clone()
            .oneshot(upload_request("image/png", bytes, cookie))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let set_cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = json_body(resp).await;
        (body["task_id"].as_str().unwrap().to_string(), set_cookie)
    }

    /// Pollea hasta un estado terminal, verificando que el progreso no baje.
    async fn wait_terminal(app: &Router, task_id: &str) -> Value {
        let mut last = 0;
        for _ in 0..500 {
            let v = json_body(get_uri(app, &format!("/progress/{task_id}")).await).await;
            let progress = v["progress"].as_u64().unwrap();
            assert!(progress >= last, "el progreso bajó de {last} a {progress}");
            last = progress;
            if matches!(v["status"].as_str(), Some("Complete" | "Error" | "Abandoned")) {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("la tarea {task_id} nunca terminó");
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let (app, _, _) = real_app();
        let resp = get_uri(&app, "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn upload_que_no_es_imagen_es_400() {
        let (app, state, _) = real_app();
        let resp = app
            .clone()
            .oneshot(upload_request("text/plain", b"hola", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["detail"], "File must be an image");
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn tarea_desconocida_es_404() {
        let (app, _, _) = real_app();
        let resp = get_uri(&app, "/progress/no-existe").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["detail"], "Task not found");
    }

    #[tokio::test]
    async fn upload_completo_con_workers_reales() {
        let (app, _, store) = real_app();
        let (task_id, cookie) = upload_ok(&app, &png(50, 100), None).await;

        let cookie = cookie.expect("primer upload sin cookie debe emitir una");
        assert!(cookie.starts_with("session_id="));
        assert!(cookie.contains("HttpOnly"));

        let v = wait_terminal(&app, &task_id).await;
        assert_eq!(v["status"], "Complete", "respuesta: {v}");
        assert_eq!(v["progress"], 100);
        let sorted = |v: &Value| {
            let mut steps: Vec<String> = serde_json::from_value(v.clone()).unwrap();
            steps.sort();
            steps
        };
        assert_eq!(sorted(&v["steps"]), sorted(&v["completed_steps"]));
        assert_eq!(v["timed_out_steps"], serde_json::json!([]));
        assert_eq!(v["result"]["stats"]["width"], 50);
        assert_eq!(v["result"]["stats"]["height"], 100);
        assert!(v["result"]["stats"]["summary"].is_string());
        assert_eq!(store.len(), 1);

        let stats = json_body(get_uri(&app, "/stats").await).await;
        assert_eq!(stats["total_images"], 1);
        assert_eq!(stats["avg_width"], 50.0);
    }

    #[tokio::test]
    async fn imagen_corrupta_termina_en_error() {
        let (app, _, store) = real_app();
        let (task_id, _) = upload_ok(&app, b"no soy un png", None).await;

        let v = wait_terminal(&app, &task_id).await;
        assert_eq!(v["status"], "Error");
        assert!(v["error"].as_str().unwrap().contains("cuadro.png"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn segundo_upload_de_la_sesion_abandona_el_primero() {
        let mut kit = Kit::happy();
        kit.cluster[1] = ("Fractal Dimension", "fd_default", 300, 5_000, None);
        let built = kit.build();
        let store: Arc<dyn RecordStore> = built.store.clone();
        let state = AppState::new(built.controller.clone(), store);
        let app = build_router(state.clone(), LIMIT);

        let cookie = "otra=1; session_id=s-1";
        let (first, set_cookie) = upload_ok(&app, b"a", Some(cookie)).await;
        assert!(set_cookie.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (second, _) = upload_ok(&app, b"b", Some(cookie)).await;

        // A ya quedó abandonada antes de que B existiera
        let a = state.registry.get(&first).unwrap();
        assert_eq!(a.status, TaskStatus::Abandoned);

        let a = wait_terminal(&app, &first).await;
        assert_eq!(a["status"], "Abandoned");
        assert_eq!(a["error"], common::ABANDONED_MESSAGE);
        let b = wait_terminal(&app, &second).await;
        assert_eq!(b["status"], "Complete");

        // dejar que el worker abandonado termine en segundo plano
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(built.store.len(), 1);
        assert_eq!(state.sessions.active_task("s-1").await, None);
    }

    #[tokio::test]
    async fn sesiones_distintas_no_se_pisan() {
        let built = Kit::happy().build();
        let store: Arc<dyn RecordStore> = built.store.clone();
        let state = AppState::new(built.controller.clone(), store);
        let app = build_router(state.clone(), LIMIT);

        let (a, _) = upload_ok(&app, b"a", Some("session_id=uno")).await;
        let (b, _) = upload_ok(&app, b"b", Some("session_id=dos")).await;

        assert_eq!(wait_terminal(&app, &a).await["status"], "Complete");
        assert_eq!(wait_terminal(&app, &b).await["status"], "Complete");
        assert_eq!(built.store.len(), 2);
    }

    #[tokio::test]
    async fn ready_models_refleja_el_flag() {
        let (app, state, _) = real_app();
        assert_eq!(json_body(get_uri(&app, "/ready_models").await).await["status"], "loading");
        state.models_ready.store(true, Ordering::SeqCst);
        assert_eq!(json_body(get_uri(&app, "/ready_models").await).await["status"], "ready");
    }

    #[test]
    fn cookie_de_sesion_entre_varias() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; session_id=abc ; b=2"));
        assert_eq!(session_from_cookies(&headers).as_deref(), Some("abc"));

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("session_id="));
        assert_eq!(session_from_cookies(&empty), None);
    }
}
