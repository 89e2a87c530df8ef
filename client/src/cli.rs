use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    AggregateStats, ErrorBody, ReadyModelsResponse, TaskRecord, TaskStatus, UploadResponse,
    SESSION_COOKIE,
};
use reqwest::{header, multipart, Client, Response};
use std::{env, path::PathBuf, time::Duration};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el servicio de análisis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sube una imagen y lanza una corrida de análisis
    Upload {
        #[arg(value_name = "IMAGEN")]
        path: PathBuf,

        /// Token de sesión a reutilizar (reemplaza la corrida anterior)
        #[arg(long)]
        session: Option<String>,

        /// Seguir el progreso hasta que termine
        #[arg(long)]
        watch: bool,
    },
    /// Muestra el estado actual de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Pollea una tarea hasta que llegue a un estado terminal
    Watch {
        #[arg(value_name = "TASK_ID")]
        id: String,

        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Estadísticas agregadas de las imágenes guardadas
    Stats,
    /// ¿Terminó la carga de modelos?
    Ready,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Upload { path, session, watch } => {
            let task_id = upload(&client, &base_url, &path, session.as_deref()).await?;
            if watch {
                watch_task(&client, &base_url, &task_id, Duration::from_millis(500)).await?;
            }
        }

        Commands::Status { id } => {
            let record = fetch_progress(&client, &base_url, &id).await?;
            print_record(&record);
        }

        Commands::Watch { id, interval_ms } => {
            watch_task(&client, &base_url, &id, Duration::from_millis(interval_ms.max(50))).await?;
        }

        Commands::Stats => {
            let resp = check(client.get(format!("{}/stats", base_url)).send().await?).await?;
            let stats: AggregateStats = resp.json().await?;
            println!("Imágenes guardadas: {}", stats.total_images);
            println!("  ancho promedio : {:.2}", stats.avg_width);
            println!("  alto promedio  : {:.2}", stats.avg_height);
            println!(
                "  color promedio : ({:.2}, {:.2}, {:.2})",
                stats.avg_color[0], stats.avg_color[1], stats.avg_color[2]
            );
        }

        Commands::Ready => {
            let resp = check(client.get(format!("{}/ready_models", base_url)).send().await?).await?;
            let ready: ReadyModelsResponse = resp.json().await?;
            println!("modelos: {:?}", ready.status);
        }
    }

    Ok(())
}

async fn upload(client: &Client, base_url: &str, path: &PathBuf, session: Option<&str>) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());

    let part = multipart::Part::bytes(bytes)
        .file_name(filename.clone())
        .mime_str(mime_for(&filename))?;
    let form = multipart::Form::new().part("file", part);

    let mut req = client.post(format!("{}/upload", base_url)).multipart(form);
    if let Some(token) = session {
        req = req.header(header::COOKIE, format!("{SESSION_COOKIE}={token}"));
    }

    let resp = check(req.send().await?).await?;
    let issued = resp
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_from_set_cookie);
    let body: UploadResponse = resp.json().await?;

    println!("Tarea creada: {}", body.task_id);
    if let Some(token) = issued {
        println!("  sesión: {} (usar --session para reemplazar esta corrida)", token);
    }
    Ok(body.task_id)
}

async fn fetch_progress(client: &Client, base_url: &str, id: &str) -> Result<TaskRecord> {
    let resp = client
        .get(format!("{}/progress/{}", base_url, id))
        .send()
        .await?;
    Ok(check(resp).await?.json().await?)
}

async fn watch_task(client: &Client, base_url: &str, id: &str, interval: Duration) -> Result<()> {
    let mut last_line = String::new();
    loop {
        let record = fetch_progress(client, base_url, id).await?;
        let line = progress_line(&record);
        if line != last_line {
            println!("{}", line);
            last_line = line;
        }

        if record.is_terminal() {
            print_record(&record);
            if record.status == TaskStatus::Error {
                bail!("la tarea {} terminó con error", id);
            }
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

/// Convierte una respuesta no exitosa en error usando `detail`.
async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let detail = resp
        .json::<ErrorBody>()
        .await
        .map(|b| b.detail)
        .unwrap_or_else(|_| "(sin detalle)".to_string());
    bail!("el servidor respondió {}: {}", status, detail)
}

fn print_record(record: &TaskRecord) {
    println!("Tarea {}", record.task_id);
    println!("  estado   : {}", record.status);
    println!("  progreso : {}%", record.progress);
    println!(
        "  pasos    : {}/{} completados",
        record.completed_steps.len(),
        record.declared_steps.len()
    );
    if !record.timed_out_steps.is_empty() {
        println!("  timeouts : {}", record.timed_out_steps.join(", "));
    }
    if let Some(err) = &record.error {
        println!("  error    : {}", err);
    }
    if let Some(result) = &record.terminal_result {
        println!("  registro : {}", result.id);
        if let Some(summary) = result.stats.get("summary").and_then(|v| v.as_str()) {
            println!("  resumen  : {}", summary);
        }
    }
}

fn progress_line(record: &TaskRecord) -> String {
    let step = record.current_step.as_deref().unwrap_or("-");
    let mut line = format!("[{:>3}%] {} ({})", record.progress, record.status, step);
    if !record.timed_out_steps.is_empty() {
        line.push_str(&format!(" timeouts={}", record.timed_out_steps.len()));
    }
    line
}

fn mime_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn session_from_set_cookie(raw: &str) -> Option<String> {
    let (name, value) = raw.split(';').next()?.trim().split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
}
