use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};
use tabtalk_core::{
    dataset::Dataset,
    error::PipelineError,
    executor::{ExecLimits, ExecPolicy},
    insight, runs, slides,
    summary::DEFAULT_PREVIEW_ROWS,
    pipeline::Pipeline,
    synthesizer::LlmConfig,
    util::is_path_within,
    workflow::{replay, WorkflowScript, WorkflowStore},
};
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub llm: LlmConfig,
    pub limits: ExecLimits,
    pub store: WorkflowStore,
    pub uploads_dir: PathBuf,
    pub runs_root: PathBuf,
}

impl AppState {
    pub fn from_env() -> anyhow::Result<Self> {
        let uploads_dir = tabtalk_core::util::default_uploads_root()?;
        let runs_root = tabtalk_core::util::default_runs_root()?;
        let store = WorkflowStore::open(&tabtalk_core::util::default_workflow_db_path()?)?;
        Ok(Self {
            llm: LlmConfig::from_env()?,
            limits: ExecLimits::default(),
            store,
            uploads_dir,
            runs_root,
        })
    }
}

type ApiError = (StatusCode, Json<Value>);

fn error_payload(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into(), "kind": kind })))
}

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    error_payload(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
}

fn pipeline_error(e: &PipelineError) -> ApiError {
    let status = match e {
        PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    };
    error_payload(status, e.kind(), e.to_string())
}

async fn health() -> &'static str {
    "ok"
}

struct UploadForm {
    file_name: String,
    bytes: Vec<u8>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    fn field(&self, name: &str) -> Result<&str, ApiError> {
        self.fields.get(name).map(|s| s.as_str()).ok_or_else(|| {
            error_payload(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("missing form field: {name}"),
            )
        })
    }
}

/// Pull the first file part plus all text fields out of a multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error_payload(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("error parsing multipart field: {e}"),
        )
    })? {
        let name = field.name().map(|s| s.to_string());
        if let Some(file_name) = field.file_name().map(|s| s.to_string()) {
            let data = field.bytes().await.map_err(|e| {
                error_payload(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    format!("failed to read upload data: {e}"),
                )
            })?;
            if file.is_none() {
                file = Some((file_name, data.to_vec()));
            }
        } else if let Some(name) = name {
            let text = field.text().await.map_err(|e| {
                error_payload(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    format!("failed to read form field: {e}"),
                )
            })?;
            fields.insert(name, text);
        }
    }
    let (file_name, bytes) = file.ok_or_else(|| {
        error_payload(StatusCode::BAD_REQUEST, "bad_request", "missing file upload")
    })?;
    if bytes.is_empty() {
        return Err(error_payload(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "uploaded file is empty",
        ));
    }
    Ok(UploadForm {
        file_name,
        bytes,
        fields,
    })
}

fn file_extension(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Parse an upload into a dataset, gating on the supported formats.
fn dataset_from_upload(form: &UploadForm) -> Result<Dataset, ApiError> {
    let bad = |msg: String| error_payload(StatusCode::BAD_REQUEST, "bad_request", msg);
    let dataset = match file_extension(&form.file_name).as_str() {
        "csv" => Dataset::from_csv_bytes(&form.bytes).map_err(|e| bad(e.to_string()))?,
        "xlsx" => Dataset::from_xlsx_bytes(&form.bytes).map_err(|e| bad(e.to_string()))?,
        "xls" => {
            return Err(bad(
                "legacy .xls uploads are not supported; convert to .xlsx".into(),
            ))
        }
        other => return Err(bad(format!("unsupported file type: {other:?}"))),
    };
    if dataset.columns().is_empty() {
        return Err(bad("uploaded file contains no data".into()));
    }
    Ok(dataset)
}

fn pipeline_for(state: &AppState, policy: ExecPolicy) -> Pipeline {
    Pipeline {
        llm: state.llm.clone(),
        limits: state.limits.clone(),
        policy,
        preview_rows: DEFAULT_PREVIEW_ROWS,
    }
}

/// Shared tail of the ad-hoc processing routes: run the pipeline, record
/// the audit artifacts, shape the response.
async fn run_pipeline_response(
    state: &AppState,
    dataset: &Dataset,
    instruction: &str,
    policy: ExecPolicy,
) -> Result<Json<Value>, ApiError> {
    let run = runs::create_new_run(Some(&state.runs_root)).map_err(internal_error)?;
    let pipeline = pipeline_for(state, policy);
    let outcome = pipeline.run_recorded(&run.dir, dataset, instruction).await;
    match outcome {
        Ok(done) => Ok(Json(json!({
            "run_id": run.id,
            "generated_code": done.script.source(),
            "columns": done.table.columns(),
            "rows": done.table.to_json_rows(),
            "row_count": done.table.row_count(),
            "csv_output": done.table.to_csv_string().map_err(internal_error)?,
        }))),
        Err(e) => Err(pipeline_error(&e)),
    }
}

async fn process_csv(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_upload(multipart).await?;
    if file_extension(&form.file_name) != "csv" {
        return Err(error_payload(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "expected a .csv upload",
        ));
    }
    let dataset = dataset_from_upload(&form)?;
    let query = form.field("query").or_else(|_| form.field("prompt"))?.to_string();
    run_pipeline_response(&state, &dataset, &query, ExecPolicy::default()).await
}

async fn process_excel(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_upload(multipart).await?;
    if file_extension(&form.file_name) != "xlsx" {
        return Err(error_payload(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "expected an .xlsx upload",
        ));
    }
    let dataset = dataset_from_upload(&form)?;
    let prompt = form.field("prompt").or_else(|_| form.field("query"))?.to_string();
    run_pipeline_response(&state, &dataset, &prompt, ExecPolicy::default()).await
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_upload(multipart).await?;
    // Validate the upload parses before committing anything.
    let _ = dataset_from_upload(&form)?;

    std::fs::create_dir_all(&state.uploads_dir).map_err(internal_error)?;
    let stored_file = state.uploads_dir.join(format!(
        "{}_{}",
        uuid::Uuid::new_v4(),
        sanitized_file_name(&form.file_name)
    ));
    std::fs::write(&stored_file, &form.bytes).map_err(internal_error)?;

    let record = state
        .store
        .create(&form.file_name, &stored_file)
        .map_err(internal_error)?;
    tracing::info!(workflow_id = %record.id, file = %record.file_name, "workflow started");
    Ok(Json(json!({
        "message": "Workflow started",
        "workflow_id": record.id,
        "file_name": record.file_name,
    })))
}

fn sanitized_file_name(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string())
}

async fn workflow_step(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&workflow_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            error_payload(StatusCode::NOT_FOUND, "not_found", "workflow not found")
        })?;

    let form = read_upload(multipart).await?;
    let dataset = dataset_from_upload(&form)?;
    let prompt = form.field("prompt")?.to_string();

    let run = runs::create_new_run(Some(&state.runs_root)).map_err(internal_error)?;
    // Steps that filter everything away would make later replay steps
    // meaningless, so this route treats an empty result as an error.
    let pipeline = pipeline_for(
        &state,
        ExecPolicy {
            empty_result_is_error: true,
        },
    );
    let done = pipeline
        .run_recorded(&run.dir, &dataset, &prompt)
        .await
        .map_err(|e| pipeline_error(&e))?;

    let step = state
        .store
        .append_script(
            &record.id,
            WorkflowScript {
                name: step_name(&prompt),
                source: done.script.source().to_string(),
            },
        )
        .map_err(internal_error)?;

    Ok(Json(json!({
        "workflow_id": record.id,
        "step": step,
        "run_id": run.id,
        "generated_code": done.script.source(),
        "columns": done.table.columns(),
        "rows": done.table.to_json_rows(),
        "row_count": done.table.row_count(),
        "csv_output": done.table.to_csv_string().map_err(internal_error)?,
    })))
}

fn step_name(prompt: &str) -> String {
    let mut name: String = prompt.trim().chars().take(80).collect();
    if name.is_empty() {
        name = "unnamed step".to_string();
    }
    name
}

async fn apply_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&workflow_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            error_payload(StatusCode::NOT_FOUND, "not_found", "workflow not found")
        })?;

    let dataset = Dataset::from_path(&record.stored_file).map_err(|e| {
        error_payload(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("stored workflow file is unreadable: {e}"),
        )
    })?;

    let limits = state.limits.clone();
    let (steps, last) = tokio::task::spawn_blocking(move || {
        replay(&record, dataset, &limits, ExecPolicy::default())
    })
    .await
    .map_err(internal_error)?;

    let step_reports: Vec<Value> = steps
        .iter()
        .map(|s| match &s.outcome {
            Ok(table) => json!({
                "name": s.name,
                "ok": true,
                "row_count": table.row_count(),
            }),
            Err(e) => json!({
                "name": s.name,
                "ok": false,
                "kind": e.kind(),
                "error": e.to_string(),
            }),
        })
        .collect();

    Ok(Json(json!({
        "workflow_id": workflow_id,
        "message": "Workflow applied.",
        "steps": step_reports,
        "columns": last.columns(),
        "rows": last.to_json_rows(),
        "row_count": last.row_count(),
        "csv_output": last.to_csv_string().map_err(internal_error)?,
    })))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&workflow_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            error_payload(StatusCode::NOT_FOUND, "not_found", "workflow not found")
        })?;
    Ok(Json(json!({
        "id": record.id,
        "file_name": record.file_name,
        "created_at": record.created_at.to_rfc3339(),
        "scripts": record.scripts,
    })))
}

async fn visualize_upload(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = read_upload(multipart).await?;
    let dataset = dataset_from_upload(&form)?;
    let result = insight::visualize(&dataset, &state.llm)
        .await
        .map_err(|e| pipeline_error(&e))?;
    Ok(Json(serde_json::to_value(result).map_err(internal_error)?))
}

async fn create_presentation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let input = body.get("data").cloned().unwrap_or(body);
    let slides = slides::generate_slides(&input, &state.llm)
        .await
        .map_err(|e| pipeline_error(&e))?;
    Ok(Json(json!({ "slides": slides })))
}

#[derive(Deserialize)]
struct ListRunsParams {
    limit: Option<usize>,
}

async fn list_runs(Query(q): Query<ListRunsParams>) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(20);
    let runs = runs::list_runs(limit).map_err(internal_error)?;
    let data: Vec<_> = runs
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "path": r.dir.to_string_lossy(),
            })
        })
        .collect();
    Ok(Json(json!({ "runs": data })))
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path((run_id, file)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let run_dir = state.runs_root.join(&run_id);
    let candidate = run_dir.join(&file);
    if !is_path_within(&run_dir, &candidate) || !candidate.exists() {
        return Err(error_payload(StatusCode::NOT_FOUND, "not_found", "not found"));
    }
    let mime = mime_guess::from_path(&candidate).first_or_text_plain();
    let bytes = tokio::fs::read(&candidate).await.map_err(internal_error)?;
    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            mime.essence_str().to_string(),
        )],
        bytes,
    )
        .into_response())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/process/csv", post(process_csv))
        .route("/process/excel", post(process_excel))
        .route("/workflows", post(start_workflow))
        .route("/workflows/:workflow_id", get(get_workflow))
        .route("/workflows/:workflow_id/steps", post(workflow_step))
        .route("/workflows/:workflow_id/apply", post(apply_workflow))
        .route("/visualize", post(visualize_upload))
        .route("/presentations", post(create_presentation))
        .route("/runs", get(list_runs))
        .route("/runs/:run_id/artifacts/:file", get(download_artifact))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve() -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_env()?);
    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8000".to_string())
        .parse()
        .unwrap_or(8000);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!(%addr, "tabtalk_server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
