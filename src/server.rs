//! HTTP and websocket surface of the form.
//!
//! Downloads run over a websocket: the client sends one [`DownloadRequest`]
//! and receives [`DownloadEvent`]s until the downloader exits. Sending the
//! text `cancel`, or dropping the socket, stops the running child.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::artifact::{self, Artifact, ArtifactError, Presentation, FAILURE_PREFIX};
use crate::bbox::{self, BoundingBox, ResolveError, UploadKind};
use crate::catalog::CatalogView;
use crate::config::AppConfig;
use crate::invoker::{CancelToken, DownloadRequest, InvokeError, Invoker};
use crate::panel::{PanelChange, PanelState};

const INDEX_HTML: &str = include_str!("web/index.html");

/// Uploads larger than this are refused before parsing.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub config: AppConfig,
    invoker: Invoker,
    active: Mutex<Option<CancelToken>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            invoker: Invoker::from_config(&config),
            config,
            active: Mutex::new(None),
        }
    }

    /// Stop whatever download is currently running, if any.
    pub fn cancel_active(&self) {
        if let Some(token) = self.active.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            info!("cancelling running download");
            token.cancel();
        }
    }

    fn begin(&self) -> Option<ActiveDownload<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return None;
        }
        let token = CancelToken::new();
        *active = Some(token.clone());
        Some(ActiveDownload { state: self, token })
    }
}

/// Marks a download as running for as long as it is alive.
struct ActiveDownload<'a> {
    state: &'a AppState,
    token: CancelToken,
}

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        *self.state.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Messages streamed to the browser while a download runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started { source_url: String, command: String },
    Line { text: String },
    Succeeded { message: String, artifact: Artifact },
    Failed { message: String },
    Cancelled,
}

impl From<Presentation> for DownloadEvent {
    fn from(presentation: Presentation) -> Self {
        match presentation {
            Presentation::Succeeded { message, artifact } => DownloadEvent::Succeeded { message, artifact },
            Presentation::Failed { message } => DownloadEvent::Failed { message },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Resolve(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Artifact(ArtifactError::InvalidName(_)) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Artifact(ArtifactError::Missing(_)) => StatusCode::NOT_FOUND,
            ApiError::Artifact(ArtifactError::Io(_)) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!(%status, error = %self, "request failed");
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/catalog", get(catalog))
        .route("/api/panel", post(update_panel))
        .route("/api/bbox", post(paste_bbox))
        .route("/api/upload", post(upload_bbox))
        .route("/ws/download", get(ws_handler))
        .route("/artifacts/{name}", get(download_artifact))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve(state: Arc<AppState>, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(state.config.bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct CatalogResponse {
    catalog: CatalogView,
    panel: PanelState,
}

async fn catalog(Extension(state): Extension<Arc<AppState>>) -> Json<CatalogResponse> {
    let release = &state.config.default_release;
    Json(CatalogResponse {
        catalog: CatalogView::new(release.clone()),
        panel: PanelState::new(release.clone()),
    })
}

#[derive(Deserialize)]
struct PanelUpdate {
    state: Option<PanelState>,
    change: PanelChange,
}

async fn update_panel(Extension(state): Extension<Arc<AppState>>, Json(update): Json<PanelUpdate>) -> Json<PanelState> {
    let current = update
        .state
        .unwrap_or_else(|| PanelState::new(state.config.default_release.clone()));
    Json(current.apply(update.change))
}

async fn paste_bbox(body: String) -> Result<Json<BoundingBox>, ApiError> {
    let bbox = bbox::from_pasted(&body)?;
    info!(%bbox, "calculated bounding box from pasted GeoJSON");
    Ok(Json(bbox))
}

async fn upload_bbox(mut multipart: Multipart) -> Result<Json<BoundingBox>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        // reject by extension before pulling the body
        UploadKind::from_file_name(&file_name)?;
        let data = field.bytes().await?;

        let name = file_name.clone();
        let bbox = tokio::task::spawn_blocking(move || bbox::from_upload(&name, data)).await??;
        info!(%bbox, file = %file_name, "calculated bounding box from upload");
        return Ok(Json(bbox));
    }
    Err(ApiError::BadRequest("missing \"file\" field".to_string()))
}

async fn download_artifact(
    Extension(state): Extension<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = artifact::locate(&state.config.output_dir, &name)?;
    let body = tokio::fs::read(&artifact.path).await.map_err(ArtifactError::from)?;
    info!(file = %artifact.file_name, size = body.len(), "serving artifact");
    Ok((
        [
            (header::CONTENT_TYPE, artifact.mime.clone()),
            (header::CONTENT_DISPOSITION, artifact.content_disposition()),
        ],
        body,
    )
        .into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, Extension(state): Extension<Arc<AppState>>) -> Response {
    debug!("download socket requested");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_event(sender: &mut futures::stream::SplitSink<WebSocket, Message>, event: &DownloadEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!(%e, "failed to encode event");
            return true;
        }
    };
    if let Err(e) = sender.send(Message::Text(Utf8Bytes::from(text))).await {
        warn!("Failed to send message to client: {}", e);
        return false;
    }
    true
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let request = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<DownloadRequest>(text.as_str()) {
                Ok(request) => break request,
                Err(e) => {
                    let message = format!("{FAILURE_PREFIX}invalid request: {e}");
                    send_event(&mut sender, &DownloadEvent::Failed { message }).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(%e, "socket error before request");
                return;
            }
        }
    };

    let Some(active) = state.begin() else {
        let message = format!("{FAILURE_PREFIX}another download is already running");
        send_event(&mut sender, &DownloadEvent::Failed { message }).await;
        return;
    };

    let started = DownloadEvent::Started {
        source_url: request.source_url(),
        command: state.invoker.command_line(&request),
    };
    info!("Downloading data from: {}", request.source_url());
    if !send_event(&mut sender, &started).await {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = {
        let invoker = state.invoker.clone();
        let cancel = active.token.clone();
        tokio::task::spawn_blocking(move || download_job(&invoker, &request, &cancel, &tx))
    };

    // forward events from the job to the websocket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !send_event(&mut sender, &event).await {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // the only thing a client says after the request is "cancel"
    let mut recv_task = {
        let cancel = active.token.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(text) if text.as_str().trim() == "cancel" => {
                        info!("client requested cancellation");
                        cancel.cancel();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        })
    };

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            debug!("client went away, stopping download");
            active.token.cancel();
            let _ = send_task.await;
        },
    }
    // a job that already finished ignores this
    active.token.cancel();

    if let Err(e) = job.await {
        warn!(%e, "download job panicked");
    }
    drop(active);
}

/// Run one download on the current (blocking) thread, reporting through `events`.
///
/// Returns the final event. Dropping the receiving side of `events` cancels
/// the download.
pub(crate) fn download_job(
    invoker: &Invoker,
    request: &DownloadRequest,
    cancel: &CancelToken,
    events: &mpsc::UnboundedSender<DownloadEvent>,
) -> DownloadEvent {
    let result = invoker.run(request, cancel, |line| {
        if events.send(DownloadEvent::Line { text: line.to_string() }).is_err() && !cancel.is_cancelled() {
            debug!("event receiver dropped, cancelling download");
            cancel.cancel();
        }
    });
    let event = match result {
        Ok(result) => artifact::present(&result).into(),
        Err(InvokeError::Cancelled) => DownloadEvent::Cancelled,
        Err(e) => {
            warn!(%e, "download failed to run");
            DownloadEvent::Failed {
                message: format!("{FAILURE_PREFIX}{e}"),
            }
        }
    };
    let _ = events.send(event.clone());
    event
}
