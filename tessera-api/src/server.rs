use std::{collections::BTreeMap, io::Write, net::SocketAddr, path::Path, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tessera_core::{
    ConversionError, ConversionRequest, Converter, ExitCategory, OutputFormat, Stage,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub const DEFAULT_BODY_LIMIT: usize = 250 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub converter: Arc<Converter>,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub listen_addr: SocketAddr,
    pub body_limit: usize,
    /// Adds the OpenTelemetry request layer.
    pub otel: bool,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    error: Option<String>,
}

/// Failure answer: status plus the stage the error is attributed to.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    stage: Stage,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            stage: Stage::Setup,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            stage: Stage::Setup,
            message: message.into(),
        }
    }
}

fn status_for(category: ExitCategory) -> StatusCode {
    match category {
        ExitCategory::BadInput => StatusCode::BAD_REQUEST,
        ExitCategory::Config => StatusCode::UNPROCESSABLE_ENTITY,
        ExitCategory::ExternalService => StatusCode::BAD_GATEWAY,
        ExitCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ConversionError> for ApiError {
    fn from(err: ConversionError) -> Self {
        Self {
            status: status_for(err.category()),
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(stage = %self.stage, "{}", self.message);
        } else {
            tracing::warn!(stage = %self.stage, "{}", self.message);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            stage: Some(self.stage),
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/convert", post(convert_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Binds `options.listen_addr` and serves until the process stops.
pub async fn serve(converter: Arc<Converter>, options: ServeOptions) -> anyhow::Result<()> {
    let mut app = router(AppState { converter }, options.body_limit);
    if options.otel {
        app = app.layer(OtelAxumLayer::default());
    }
    let listener = TcpListener::bind(options.listen_addr).await?;
    tracing::info!(
        "Starting tessera service listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse {
        success: true,
        data: Some("Service is healthy"),
        stage: None,
        error: None,
    })
}

/// Upload kept on disk for the run. The original extension is kept since
/// input detection falls back to it.
struct Upload {
    file: NamedTempFile,
    doc_name: String,
}

impl Upload {
    fn create(file_name: Option<&str>) -> Result<Self, ApiError> {
        let path = Path::new(file_name.unwrap_or_default());
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let doc_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let file = tempfile::Builder::new()
            .prefix("tessera-upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| ApiError::internal(format!("Failed to create temp file: {e}")))?;
        Ok(Self { file, doc_name })
    }
}

#[tracing::instrument(skip_all)]
async fn convert_handler(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<Upload> = None;
    let mut overrides = BTreeMap::new();
    let mut format: Option<OutputFormat> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to get next field: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let mut target = Upload::create(field.file_name())?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read chunk: {e}")))?
                {
                    target.file.write_all(&chunk).map_err(|e| {
                        ApiError::internal(format!("Failed to write to temp file: {e}"))
                    })?;
                }
                target
                    .file
                    .flush()
                    .map_err(|e| ApiError::internal(format!("Failed to flush temp file: {e}")))?;
                upload = Some(target);
            }
            "options" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read options: {e}")))?;
                match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => overrides.extend(map),
                    Ok(_) => return Err(ApiError::bad_request("options must be a JSON object")),
                    Err(e) => {
                        return Err(ApiError::bad_request(format!("Failed to parse options: {e}")))
                    }
                }
            }
            "format" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read format: {e}")))?;
                format = Some(
                    text.trim()
                        .parse()
                        .map_err(|e: tessera_core::render::UnknownFormat| {
                            ApiError::bad_request(e.to_string())
                        })?,
                );
            }
            _ => continue,
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("missing 'file' field"))?;
    let format = format
        .or_else(|| {
            headers
                .get(ACCEPT)
                .and_then(|h| h.to_str().ok())
                .and_then(OutputFormat::from_accept)
        })
        .unwrap_or(OutputFormat::Json);

    let mut request = ConversionRequest::new(upload.file.path())
        .with_formats([format])
        .with_doc_name(upload.doc_name.clone());
    request.overrides = overrides;

    // a dropped request (client gone) cancels the conversion
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state.converter.convert(&request, &cancel).await?;

    let output = result
        .outputs
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::internal("no output rendered"))?;
    Ok(([(CONTENT_TYPE, output.mime_type)], output.content).into_response())
}
