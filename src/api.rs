//! HTTP front door.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::header::CONTENT_TYPE,
    response::Json,
    routing::{delete, get, post},
    Form, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::batch::BatchDispatcher;
use crate::config::{LlmSettings, Settings};
use crate::error::{GatewayError, Result};
use crate::extractor::{ExtractionOptions, ExtractionResult, Extractor};
use crate::files::{allowed_file, sanitize_filename, ALLOWED_EXTENSIONS};
use crate::llm::{LlmOptions, LlmProcessor, LlmStep, LlmTask};
use crate::ocr::OcrEngine;
use crate::upload::UploadStore;

/// Headroom on top of the file ceiling for multipart framing and form fields.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub extractor: Extractor,
    pub uploads: UploadStore,
    /// Present when an API key is configured.
    pub llm: Option<LlmProcessor>,
}

impl AppState {
    pub fn new(settings: Settings, engine: Arc<dyn OcrEngine>, llm: Option<LlmProcessor>) -> Self {
        let uploads = UploadStore::new(&settings.upload.dir, settings.upload.max_file_size);
        Self {
            settings: Arc::new(settings),
            extractor: Extractor::new(engine),
            uploads,
            llm,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = (state.settings.upload.max_file_size + MULTIPART_OVERHEAD) as usize;

    Router::new()
        .route("/health", get(health))
        .route("/languages", get(languages))
        .route("/gemini/tasks", get(llm_tasks))
        .route("/ocr", post(process_ocr))
        .route("/ocr/gemini", post(process_ocr_with_llm))
        .route("/batch/ocr", post(batch_ocr))
        .route("/upload/init", post(init_upload))
        .route("/upload/chunk/{upload_id}", post(upload_chunk))
        .route("/upload/complete/{upload_id}", post(complete_upload))
        .route("/upload/cancel/{upload_id}", delete(cancel_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Form parsing
// ============================================================================

struct UploadedFile {
    field: String,
    filename: String,
    bytes: Vec<u8>,
}

/// Multipart or urlencoded body; any other content type reads as empty.
#[derive(Default)]
struct FormData {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

impl<S> FromRequest<S> for FormData
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
            return FormData::read_multipart(multipart).await;
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
            return Ok(FormData {
                fields,
                files: Vec::new(),
            });
        }

        Ok(FormData::default())
    }
}

impl FormData {
    async fn read_multipart(mut multipart: Multipart) -> Result<Self> {
        let mut form = FormData::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| GatewayError::InvalidInput(format!("Multipart error: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(filename) => {
                    let bytes = field.bytes().await.map_err(|e| {
                        GatewayError::InvalidInput(format!("Failed to read file: {}", e))
                    })?;
                    form.files.push(UploadedFile {
                        field: name,
                        filename,
                        bytes: bytes.to_vec(),
                    });
                }
                None => {
                    let text = field.text().await.map_err(|e| {
                        GatewayError::InvalidInput(format!("Failed to read field '{}': {}", name, e))
                    })?;
                    form.fields.insert(name, text);
                }
            }
        }

        Ok(form)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn text_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.text(name).unwrap_or(default)
    }

    /// `true` only for a case-insensitive `"true"`.
    fn flag(&self, name: &str, default: bool) -> bool {
        self.text(name)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.text(name).map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                GatewayError::InvalidInput(format!("Invalid value for '{}': {}", name, raw))
            }),
        }
    }

    fn file(&self, field: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field == field)
    }

    fn extraction_options(&self, settings: &Settings) -> ExtractionOptions {
        ExtractionOptions {
            language: self
                .text_or("language", &settings.ocr.default_language)
                .to_string(),
            config: self
                .text_or("config", &settings.ocr.default_config)
                .to_string(),
            preprocess: self.flag("preprocess", false),
        }
    }

    fn llm_options(&self) -> Result<LlmOptions> {
        Ok(LlmOptions {
            task: LlmTask::parse_or_default(self.text_or("gemini_task", "analyze")),
            prompt: self
                .text("gemini_prompt")
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string),
            temperature: self.parsed("gemini_temperature")?.unwrap_or(0.7),
            max_tokens: self.parsed("gemini_max_tokens")?,
        })
    }
}

/// Validate a single `file` upload the way `/ocr` and `/ocr/gemini` expect it.
fn required_file(form: &FormData) -> Result<&UploadedFile> {
    let file = form
        .file("file")
        .ok_or_else(|| GatewayError::InvalidInput("No file provided".to_string()))?;
    if file.filename.is_empty() {
        return Err(GatewayError::InvalidInput("No file selected".to_string()));
    }
    if !allowed_file(&file.filename) {
        return Err(GatewayError::InvalidInput(format!(
            "File type not allowed. Allowed types: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    Ok(file)
}

/// Sanitized on-disk name that keeps the original extension.
fn staged_name(original: &str) -> String {
    let clean = sanitize_filename(original);
    if allowed_file(&clean) {
        return clean;
    }
    let ext = original.rsplit_once('.').map(|(_, e)| e).unwrap_or("bin");
    format!("upload.{}", ext.to_ascii_lowercase())
}

/// Write an upload into a fresh directory that is removed when dropped.
async fn stage(dir: &Path, file: &UploadedFile) -> Result<(tempfile::TempDir, PathBuf)> {
    tokio::fs::create_dir_all(dir).await?;
    let staging = tempfile::Builder::new().prefix("ocr-").tempdir_in(dir)?;
    let path = staging.path().join(staged_name(&file.filename));
    tokio::fs::write(&path, &file.bytes).await?;
    Ok((staging, path))
}

fn llm_unavailable() -> GatewayError {
    GatewayError::InvalidInput("Gemini integration not available".to_string())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "gemini_available": state.llm.is_some(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn languages(State(state): State<AppState>) -> Result<Json<Value>> {
    let mut languages = state
        .extractor
        .engine()
        .languages()
        .await
        .map_err(|e| GatewayError::ExternalTool(format!("{:#}", e)))?;
    languages.sort();

    Ok(Json(json!({ "success": true, "languages": languages })))
}

async fn llm_tasks(State(state): State<AppState>) -> Result<Json<Value>> {
    if state.llm.is_none() {
        return Err(llm_unavailable());
    }
    let tasks: serde_json::Map<String, Value> = LlmTask::ALL
        .iter()
        .map(|t| (t.to_string(), Value::from(t.description())))
        .collect();

    Ok(Json(json!({ "success": true, "tasks": tasks })))
}

async fn run_single(state: &AppState, form: &FormData) -> Result<ExtractionResult> {
    let file = required_file(form)?;
    let options = form.extraction_options(&state.settings);

    let (_staging, path) = stage(&state.settings.upload.dir, file).await?;
    info!("Received file: {} ({} bytes)", file.filename, file.bytes.len());

    let result = state.extractor.extract(&path, &options).await;
    match result.error {
        Some(error) => Err(GatewayError::Extraction(error)),
        None => Ok(result),
    }
}

async fn process_ocr(State(state): State<AppState>, form: FormData) -> Result<Json<Value>> {
    let result = run_single(&state, &form).await?;
    Ok(Json(json!({ "success": true, "data": result })))
}

async fn process_ocr_with_llm(State(state): State<AppState>, form: FormData) -> Result<Json<Value>> {
    required_file(&form)?;
    let llm_options = form.llm_options()?;

    let processor = match form.text("gemini_api_key").filter(|k| !k.trim().is_empty()) {
        Some(key) => LlmProcessor::from_settings(&LlmSettings::with_key(key))
            .map_err(|e| GatewayError::Internal(format!("{:#}", e)))?,
        None => state.llm.clone().ok_or_else(|| {
            GatewayError::InvalidInput(
                "GEMINI_API_KEY not found. Please provide it in the request or set environment variable"
                    .to_string(),
            )
        })?,
    };

    let ocr = run_single(&state, &form).await?;
    let llm = processor.process_text(&ocr.text, &llm_options).await;

    Ok(Json(json!({
        "success": true,
        "data": { "ocr": ocr, "gemini": llm },
    })))
}

async fn batch_ocr(State(state): State<AppState>, form: FormData) -> Result<Json<Value>> {
    let uploads: Vec<&UploadedFile> = form.files.iter().filter(|f| f.field == "files").collect();
    if uploads.is_empty() {
        return Err(GatewayError::InvalidInput("No files provided".to_string()));
    }

    let options = form.extraction_options(&state.settings);
    let workers = form
        .parsed::<usize>("workers")?
        .unwrap_or(state.settings.batch.workers);
    let continue_on_error = form.flag("continue_on_error", true);
    let llm = match (&state.llm, form.flag("use_gemini", false)) {
        (Some(processor), true) => Some(LlmStep {
            processor: processor.clone(),
            options: LlmOptions {
                task: LlmTask::parse_or_default(form.text_or("gemini_task", "analyze")),
                ..Default::default()
            },
        }),
        _ => None,
    };

    tokio::fs::create_dir_all(&state.settings.upload.dir).await?;
    let staging = tempfile::Builder::new()
        .prefix("ocr-batch-")
        .tempdir_in(&state.settings.upload.dir)?;

    let mut failures = Vec::new();
    let mut paths = Vec::new();
    for (i, upload) in uploads.iter().enumerate() {
        if !allowed_file(&upload.filename) {
            failures.push(json!({ "filename": upload.filename, "error": "File type not allowed" }));
            continue;
        }
        // One directory per upload so identical names do not collide.
        let slot = staging.path().join(i.to_string());
        tokio::fs::create_dir_all(&slot).await?;
        let path = slot.join(staged_name(&upload.filename));
        tokio::fs::write(&path, &upload.bytes).await?;
        paths.push(path);
    }

    let outcome = BatchDispatcher::new(state.extractor.clone(), workers)
        .process(paths, &options, llm.as_ref(), continue_on_error)
        .await;

    failures.extend(
        outcome
            .failures
            .iter()
            .map(|f| json!({ "filename": f.file, "error": f.error })),
    );

    Ok(Json(json!({
        "success": true,
        "data": {
            "total": uploads.len(),
            "processed": outcome.processed(),
            "failed": failures.len(),
            "results": outcome.successes,
            "failures": failures,
            "halted": outcome.halted,
            "skipped": outcome.skipped,
        },
    })))
}

#[derive(Deserialize)]
struct InitRequest {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    chunk_count: usize,
}

async fn init_upload(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = payload.map_err(|e| GatewayError::InvalidInput(e.body_text()))?;

    let upload_id = state
        .uploads
        .init(&request.filename, request.filesize, request.chunk_count)
        .await?;

    Ok(Json(json!({
        "success": true,
        "upload_id": upload_id,
        "chunk_size": state.settings.upload.chunk_size,
    })))
}

async fn upload_chunk(
    State(state): State<AppState>,
    axum::extract::Path(upload_id): axum::extract::Path<String>,
    form: FormData,
) -> Result<Json<Value>> {
    if !state.uploads.contains(&upload_id) {
        return Err(GatewayError::NotFound("Invalid upload session".to_string()));
    }
    let chunk = form
        .file("chunk")
        .ok_or_else(|| GatewayError::InvalidInput("No chunk data provided".to_string()))?;
    let chunk_index: i64 = form
        .parsed("chunk_index")
        .map_err(|_| GatewayError::InvalidInput("Invalid chunk index".to_string()))?
        .unwrap_or(-1);

    let progress = state
        .uploads
        .append_chunk(&upload_id, chunk_index, &chunk.bytes)
        .await?;

    Ok(Json(json!({
        "success": true,
        "chunk_index": chunk_index,
        "received": progress.received,
        "total": progress.total,
        "is_complete": progress.is_complete,
    })))
}

async fn complete_upload(
    State(state): State<AppState>,
    axum::extract::Path(upload_id): axum::extract::Path<String>,
    form: FormData,
) -> Result<Json<Value>> {
    let options = form.extraction_options(&state.settings);
    let llm = if form.flag("use_gemini", false) {
        let processor = state.llm.clone().ok_or_else(llm_unavailable)?;
        Some(LlmStep {
            processor,
            options: form.llm_options()?,
        })
    } else {
        None
    };

    let extractor = state.extractor.clone();
    let data = state
        .uploads
        .complete(&upload_id, |path| async move {
            let ocr = extractor.extract(&path, &options).await;
            let mut data = json!({ "ocr": ocr });
            if let (Some(step), true) = (llm, ocr.is_success()) {
                let outcome = step.processor.process_text(&ocr.text, &step.options).await;
                data["gemini"] = json!(outcome);
            }
            Ok(data)
        })
        .await?;

    Ok(Json(json!({ "success": true, "data": data })))
}

async fn cancel_upload(
    State(state): State<AppState>,
    axum::extract::Path(upload_id): axum::extract::Path<String>,
) -> Result<Json<Value>> {
    state.uploads.cancel(&upload_id).await?;
    Ok(Json(json!({ "success": true, "message": "Upload cancelled" })))
}
