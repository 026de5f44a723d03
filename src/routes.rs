use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cleanup::DeletionScheduler,
    config::Config,
    error::ApiError,
    extractor::{ExtractionError, ExtractionOptions, MediaExtractor, MediaType},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub deletions: DeletionScheduler,
}

impl AppState {
    pub fn new(config: Config, extractor: Arc<dyn MediaExtractor>) -> Self {
        let deletions = DeletionScheduler::new(config.delete_delay);
        Self {
            config: Arc::new(config),
            extractor,
            deletions,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    #[serde(rename = "type")]
    media_type: String,
    #[serde(default)]
    use_cookies: bool,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    status: &'static str,
    title: Option<String>,
    #[serde(rename = "type")]
    media_type: MediaType,
    download_url: String,
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    Ok(Router::new()
        .route("/health", get(health))
        .route("/download", post(download_media))
        .route("/file/{filename}", get(serve_file))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn download_media(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = payload.url.trim();
    if !is_http_url(url) {
        return Err(ApiError::bad_request("Invalid URL"));
    }

    let media_type = MediaType::parse(&payload.media_type)
        .ok_or_else(|| ApiError::bad_request("type must be 'audio' or 'video'"))?;

    let config = &state.config;
    let cookie_file = if payload.use_cookies {
        if !path_exists(&config.cookie_file).await {
            return Err(ApiError::bad_request("Cookie file not found"));
        }
        Some(config.cookie_file.clone())
    } else {
        None
    };

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?;

    let file_id = Uuid::new_v4().simple().to_string();
    let mut options = ExtractionOptions::new(media_type, &config.download_dir, &file_id);
    if let Some(cookie_file) = cookie_file {
        options = options.with_cookie_file(cookie_file);
    }

    info!("Downloading {url} as {media_type:?} into {file_id}");
    let media = state
        .extractor
        .extract(url, &options)
        .await
        .map_err(|error| match error {
            ExtractionError::Failed(message) => {
                warn!("Extraction failed for {url}: {message}");
                ApiError::bad_request(format!(
                    "Download failed: {message}. If video requires login, set `use_cookies` to true and provide cookies.txt"
                ))
            }
            ExtractionError::Unknown(message) => {
                warn!("Unexpected extraction error for {url}: {message}");
                ApiError::internal(message)
            }
        })?;

    let file_path = options.output_path(&media.ext);
    if !path_exists(&file_path).await {
        warn!(
            "Extractor reported success but {} is missing",
            file_path.display()
        );
        return Err(ApiError::internal("Download failed"));
    }

    let filename = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ApiError::internal("Download failed"))?;

    Ok(Json(DownloadResponse {
        status: "success",
        title: media.title,
        media_type,
        download_url: format!("/file/{filename}"),
    }))
}

async fn serve_file(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    let file_path = resolve_served_file(&state.config.download_dir, &filename)
        .await
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => return Err(ApiError::internal(error.to_string())),
    };
    let content_length = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?
        .len();

    if state.deletions.schedule(file_path.clone()).await {
        debug!(
            "Scheduled deletion of {} in {:?}",
            file_path.display(),
            state.config.delete_delay
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Maps a requested name onto a regular file directly inside `download_dir`.
async fn resolve_served_file(download_dir: &Path, filename: &str) -> Option<PathBuf> {
    let requested = Path::new(filename);
    if requested.file_name().and_then(|name| name.to_str()) != Some(filename) {
        return None;
    }

    let candidate = download_dir.join(requested);
    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let canonical_dir = tokio::fs::canonicalize(download_dir).await.ok()?;
    let canonical_candidate = tokio::fs::canonicalize(&candidate).await.ok()?;
    if !canonical_candidate.starts_with(&canonical_dir) {
        warn!(
            "Refused to serve a file outside the download directory: {:?}",
            canonical_candidate
        );
        return None;
    }

    Some(candidate)
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let base = CorsLayer::new().allow_methods([Method::GET, Method::POST]).allow_headers(Any);

    if configured.is_empty() {
        info!("ALLOWED_ORIGINS is not set; accepting requests from any origin.");
        return Ok(base.allow_origin(Any).expose_headers([CONTENT_DISPOSITION]));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(base
        .allow_origin(allow_origin)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
