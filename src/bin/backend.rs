#![forbid(unsafe_code)]

//! Axum server for the video archive.
//!
//! Submissions are written to SQLite as `pending` rows and handed to the
//! download workers; everything else is a read (or delete) against the
//! database plus the asset directory on disk.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use vidarchive::assets::{remove_assets, resolve_asset_path};
use vidarchive::config::{RuntimeOverrides, resolve_runtime_config};
use vidarchive::fetch::{Fetcher, YtDlpFetcher, ensure_program_available};
use vidarchive::jobs::{DownloadJob, DownloadQueue, QueueStats, WorkerContext};
use vidarchive::metadata::{
    DEFAULT_PAGE, DEFAULT_PAGE_SIZE, Page, VideoRecord, VideoStore, total_pages,
};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Video archive HTTP server", version)]
struct BackendArgs {
    /// Directory holding videos.db and the videos/ asset folder
    #[arg(long)]
    media_root: Option<PathBuf>,
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Number of concurrent downloads
    #[arg(long)]
    workers: Option<usize>,
    /// Path to the yt-dlp executable
    #[arg(long = "yt-dlp")]
    yt_dlp: Option<PathBuf>,
    /// Alternate dotenv file
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            media_root: self.media_root,
            archive_host: self.host,
            archive_port: self.port,
            workers: self.workers,
            yt_dlp: self.yt_dlp,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/ARCHIVE_HOST")
}

#[derive(Clone)]
struct AppState {
    store: Arc<VideoStore>,
    queue: DownloadQueue,
    assets: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Logs the full chain; the client only sees a generic 500.
    fn from_store(err: anyhow::Error) -> Self {
        error!("database operation failed: {err:#}");
        Self::internal("internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    id: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    message: String,
    id: i64,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct VideoListing {
    videos: Vec<VideoRecord>,
    page: i64,
    page_size: i64,
    total_videos: i64,
    total_pages: i64,
}

impl VideoListing {
    fn new(videos: Vec<VideoRecord>, page: Page, total_videos: i64) -> Self {
        Self {
            videos,
            page: page.page,
            page_size: page.page_size,
            total_videos,
            total_pages: total_pages(total_videos, page.page_size),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;
    let host = parse_host_arg(&config.archive_host)?;

    let assets_dir = config.assets_dir();
    tokio::fs::create_dir_all(&assets_dir)
        .await
        .with_context(|| format!("creating {}", assets_dir.display()))?;

    if let Err(err) = ensure_program_available(&config.yt_dlp) {
        warn!("{err:#}; downloads will fail until it is installed");
    }

    let store = Arc::new(
        VideoStore::open(&config.database_path())
            .await
            .context("initializing video store")?,
    );
    let fetcher: Arc<dyn Fetcher> = Arc::new(YtDlpFetcher::new(&config.yt_dlp));
    let queue = DownloadQueue::start(
        WorkerContext {
            store: store.clone(),
            fetcher,
            assets_dir: assets_dir.clone(),
        },
        config.workers,
    );

    let recovered = queue
        .recover_pending(&store)
        .await
        .context("re-queueing pending downloads")?;
    if recovered > 0 {
        info!(recovered, "re-queued downloads left pending by a previous run");
    }

    let app = router(AppState {
        store,
        queue,
        assets: Arc::new(assets_dir),
    });

    let addr = SocketAddr::new(host, config.archive_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        media_root = %config.media_root.display(),
        workers = config.workers,
        "archive server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running archive server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(submit_download))
        .route("/videos", get(list_videos))
        .route("/videos/{*path}", get(serve_asset))
        .route("/video/{id}", get(get_video).delete(delete_video))
        .route("/delete", post(legacy_delete))
        .route("/search", get(search_videos))
        .route("/queue", get(queue_stats))
        .fallback(unknown_endpoint)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", err);
    }
    info!("shutdown requested");
}

async fn unknown_endpoint() -> ApiError {
    ApiError::not_found("endpoint not found")
}

/// Accepts only absolute http(s) URLs with a host. The submitted text is
/// stored as-is (trimmed), not in its normalized form.
fn validate_source_url(raw: Option<&str>) -> ApiResult<String> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let parsed =
        Url::parse(raw).map_err(|err| ApiError::bad_request(format!("invalid url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("url must be an http or https URL"));
    }
    Ok(raw.to_string())
}

fn page_from(page: Option<i64>, page_size: Option<i64>) -> ApiResult<Page> {
    Page::new(
        page.unwrap_or(DEFAULT_PAGE),
        page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    )
    .map_err(|err| ApiError::bad_request(err.to_string()))
}

async fn submit_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let url = validate_source_url(request.url.as_deref())?;

    let id = state
        .store
        .insert_pending(&url)
        .await
        .map_err(ApiError::from_store)?;
    // A row that cannot be queued stays pending and is picked up on restart.
    state
        .queue
        .enqueue(DownloadJob {
            record_id: id,
            url: url.clone(),
        })
        .map_err(|err| {
            error!(record_id = id, "could not queue download: {err:#}");
            ApiError::internal(err.to_string())
        })?;
    info!(record_id = id, %url, "download queued");

    Ok(Json(SubmitResponse {
        message: "Download started".into(),
        id,
    }))
}

async fn list_videos(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<VideoListing>> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let page = page_from(query.page, query.page_size)?;

    let total = state
        .store
        .count_ready()
        .await
        .map_err(ApiError::from_store)?;
    let videos = state
        .store
        .list_ready(page)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(VideoListing::new(videos, page, total)))
}

async fn search_videos(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<Json<VideoListing>> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let page = page_from(query.page, query.page_size)?;

    let total = state
        .store
        .count_search(&query.q)
        .await
        .map_err(ApiError::from_store)?;
    let videos = state
        .store
        .search(&query.q, page)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(VideoListing::new(videos, page, total)))
}

async fn get_video(
    State(state): State<AppState>,
    id: Result<AxumPath<i64>, PathRejection>,
) -> ApiResult<Json<VideoRecord>> {
    let AxumPath(id) = id.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    state
        .store
        .get(id)
        .await
        .map_err(ApiError::from_store)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Video not found"))
}

async fn delete_video(
    State(state): State<AppState>,
    id: Result<AxumPath<i64>, PathRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let AxumPath(id) = id.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    delete_record(&state, id).await
}

/// `POST /delete` with `{"id": ...}`, kept for older clients.
async fn legacy_delete(
    State(state): State<AppState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    delete_record(&state, request.id).await
}

/// Removes the asset files (missing ones only produce a warning) and then the
/// row itself. Files still listed by another row are left in place.
async fn delete_record(state: &AppState, id: i64) -> ApiResult<Json<MessageResponse>> {
    let record = state
        .store
        .get(id)
        .await
        .map_err(ApiError::from_store)?
        .ok_or_else(|| ApiError::not_found("Video not found"))?;

    let names: Vec<String> = record.filename.into_iter().chain(record.thumbnail).collect();
    let unshared = state
        .store
        .unshared_assets(id, &names)
        .await
        .map_err(ApiError::from_store)?;
    let removed = remove_assets(&state.assets, &unshared).await;

    if !state
        .store
        .delete(id)
        .await
        .map_err(ApiError::from_store)?
    {
        return Err(ApiError::not_found("Video not found"));
    }
    info!(record_id = id, removed, "video deleted");

    Ok(Json(MessageResponse {
        message: "Video deleted successfully".into(),
    }))
}

async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

async fn serve_asset(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let target = resolve_asset_path(&state.assets, &path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_file() => stream_file(target, &headers).await,
        _ => Err(ApiError::not_found("file not found")),
    }
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{}", size))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {}-{}/{}", start, end, size))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    // Multi-range requests are answered with the whole file.
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::{body::to_bytes, extract::State as AxumState};
    use serde_json::Value;
    use std::{path::Path, time::Duration};
    use tempfile::tempdir;
    use vidarchive::fetch::{ExtractedMedia, ThumbnailData};
    use vidarchive::metadata::{Completion, VideoStatus};

    /// Names the video after the last 11 characters of the URL. URLs
    /// containing "broken" fail.
    struct FakeFetcher;

    impl Fetcher for FakeFetcher {
        fn extract(&self, url: &str, output_dir: &Path) -> Result<ExtractedMedia> {
            if url.contains("broken") {
                bail!("unsupported site");
            }
            let id = &url[url.len() - 11..];
            let path = output_dir.join(format!("{id}.mp4"));
            std::fs::write(&path, b"video-bytes")?;
            Ok(ExtractedMedia {
                title: Some("Some Title".into()),
                video_path: path,
                thumbnail_url: Some(format!("https://img.example/{id}.webp")),
            })
        }

        fn fetch_thumbnail(&self, _url: &str) -> Result<ThumbnailData> {
            Ok(ThumbnailData {
                bytes: b"thumb".to_vec(),
                content_type: Some("image/webp".into()),
            })
        }
    }

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        assets: PathBuf,
        store: Arc<VideoStore>,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new() -> Self {
            let temp = tempdir().unwrap();
            let assets = temp.path().join("videos");
            std::fs::create_dir_all(&assets).unwrap();
            let store = Arc::new(VideoStore::open(&temp.path().join("videos.db")).await.unwrap());
            let queue = DownloadQueue::start(
                WorkerContext {
                    store: store.clone(),
                    fetcher: Arc::new(FakeFetcher),
                    assets_dir: assets.clone(),
                },
                2,
            );
            let state = AppState {
                store: store.clone(),
                queue,
                assets: Arc::new(assets.clone()),
            };
            Self {
                _temp: temp,
                assets,
                store,
                state,
            }
        }

        /// Inserts a finished record along with its files on disk.
        async fn insert_ready(&self, video_id: &str, title: Option<&str>) -> i64 {
            let id = self
                .store
                .insert_pending(&format!("https://example.com/watch?v={video_id}"))
                .await
                .unwrap();
            let filename = format!("{video_id}.mp4");
            let thumbnail = format!("{video_id}.jpg");
            std::fs::write(self.assets.join(&filename), b"video-bytes").unwrap();
            std::fs::write(self.assets.join(&thumbnail), b"thumb").unwrap();
            self.store
                .mark_ready(
                    id,
                    &Completion {
                        title: title.map(str::to_string),
                        filename,
                        thumbnail: Some(thumbnail),
                        video_id: video_id.into(),
                    },
                )
                .await
                .unwrap();
            id
        }

        async fn submit(&self, url: Option<&str>) -> ApiResult<Json<SubmitResponse>> {
            submit_download(
                AxumState(self.state.clone()),
                Ok(Json(DownloadRequest {
                    url: url.map(str::to_string),
                })),
            )
            .await
        }

        async fn list(
            &self,
            page: Option<i64>,
            page_size: Option<i64>,
        ) -> ApiResult<Json<VideoListing>> {
            list_videos(
                AxumState(self.state.clone()),
                Ok(Query(ListQuery { page, page_size })),
            )
            .await
        }

        async fn search(&self, q: &str) -> VideoListing {
            let Json(listing) = search_videos(
                AxumState(self.state.clone()),
                Ok(Query(SearchQuery {
                    q: q.into(),
                    ..SearchQuery::default()
                })),
            )
            .await
            .unwrap();
            listing
        }

        async fn wait_until_settled(&self, id: i64) -> VideoRecord {
            for _ in 0..500 {
                let record = self.store.get(id).await.unwrap().expect("record exists");
                if record.status != VideoStatus::Pending {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("record {id} never left pending");
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn submit_creates_placeholder_and_completes_in_background() {
        let ctx = BackendTestContext::new().await;
        let url = "https://example.com/watch?v=abcdefghijk";

        let Json(response) = ctx.submit(Some(url)).await.unwrap();
        assert_eq!(response.message, "Download started");

        let placeholder = ctx.store.get(response.id).await.unwrap().unwrap();
        assert_eq!(placeholder.url, url);

        let record = ctx.wait_until_settled(response.id).await;
        assert_eq!(record.status, VideoStatus::Ready);
        assert_eq!(record.title.as_deref(), Some("Some Title"));
        assert_eq!(record.filename.as_deref(), Some("abcdefghijk.mp4"));
        assert_eq!(record.thumbnail.as_deref(), Some("abcdefghijk.webp"));
        assert_eq!(record.video_id.as_deref(), Some("abcdefghijk"));
    }

    #[tokio::test]
    async fn same_url_twice_yields_two_independent_records() {
        let ctx = BackendTestContext::new().await;
        let url = "https://example.com/watch?v=abcdefghijk";

        let Json(first) = ctx.submit(Some(url)).await.unwrap();
        let Json(second) = ctx.submit(Some(url)).await.unwrap();
        assert_ne!(first.id, second.id);

        assert_eq!(ctx.wait_until_settled(first.id).await.status, VideoStatus::Ready);
        assert_eq!(ctx.wait_until_settled(second.id).await.status, VideoStatus::Ready);
    }

    #[tokio::test]
    async fn failed_extraction_is_visible_on_the_record() {
        let ctx = BackendTestContext::new().await;
        let Json(response) = ctx
            .submit(Some("https://broken.example/watch?v=abcdefghijk"))
            .await
            .unwrap();

        let record = ctx.wait_until_settled(response.id).await;
        assert_eq!(record.status, VideoStatus::Failed);
        assert!(record.error.unwrap().contains("unsupported site"));

        let Json(listing) = ctx.list(None, None).await.unwrap();
        assert_eq!(listing.total_videos, 0);
    }

    #[tokio::test]
    async fn submit_rejects_missing_or_invalid_urls() {
        let ctx = BackendTestContext::new().await;
        let rejected = [
            None,
            Some(""),
            Some("   "),
            Some("not a url"),
            Some("ftp://example.com/a"),
            Some("file:///etc/passwd"),
        ];
        for url in rejected {
            let err = ctx.submit(url).await.unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "url {url:?}");
        }
        assert!(ctx.store.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_hides_incomplete_records_and_paginates() {
        let ctx = BackendTestContext::new().await;
        ctx.store.insert_pending("https://example.com/pending").await.unwrap();
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(ctx.insert_ready(&format!("video{n:06}"), Some("Clip")).await);
        }

        let Json(first) = ctx.list(Some(1), Some(2)).await.unwrap();
        assert_eq!(first.total_videos, 3);
        assert_eq!(first.total_pages, 2);
        assert_eq!(first.page, 1);
        assert_eq!(first.page_size, 2);
        assert_eq!(
            first.videos.iter().map(|video| video.id).collect::<Vec<_>>(),
            ids[..2]
        );
        assert!(first.videos.iter().all(|video| video.filename.is_some()));

        let Json(second) = ctx.list(Some(2), Some(2)).await.unwrap();
        assert_eq!(second.videos.len(), 1);
        assert_eq!(second.videos[0].id, ids[2]);

        let Json(defaults) = ctx.list(None, None).await.unwrap();
        assert_eq!(defaults.page, DEFAULT_PAGE);
        assert_eq!(defaults.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(defaults.total_pages, 1);
    }

    #[tokio::test]
    async fn listing_rejects_non_positive_paging() {
        let ctx = BackendTestContext::new().await;
        assert_eq!(
            ctx.list(Some(0), None).await.unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ctx.list(None, Some(-5)).await.unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn empty_listing_reports_zero_pages() {
        let ctx = BackendTestContext::new().await;
        let Json(listing) = ctx.list(None, None).await.unwrap();
        assert!(listing.videos.is_empty());
        assert_eq!(listing.total_videos, 0);
        assert_eq!(listing.total_pages, 0);
    }

    #[tokio::test]
    async fn get_video_returns_pending_records_and_404s_missing_ones() {
        let ctx = BackendTestContext::new().await;
        let id = ctx
            .store
            .insert_pending("https://example.com/pending")
            .await
            .unwrap();

        let Json(record) = get_video(AxumState(ctx.state.clone()), Ok(AxumPath(id)))
            .await
            .unwrap();
        assert_eq!(record.status, VideoStatus::Pending);
        assert!(record.filename.is_none());

        let err = get_video(AxumState(ctx.state.clone()), Ok(AxumPath(id + 100)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_files_and_row() {
        let ctx = BackendTestContext::new().await;
        let id = ctx.insert_ready("abcdefghijk", Some("Some Title")).await;

        let Json(response) = delete_video(AxumState(ctx.state.clone()), Ok(AxumPath(id)))
            .await
            .unwrap();
        assert_eq!(response.message, "Video deleted successfully");
        assert!(!ctx.assets.join("abcdefghijk.mp4").exists());
        assert!(!ctx.assets.join("abcdefghijk.jpg").exists());
        assert!(ctx.store.get(id).await.unwrap().is_none());
        assert_eq!(ctx.search("Some").await.total_videos, 0);
        let Json(listing) = ctx.list(None, None).await.unwrap();
        assert!(listing.videos.is_empty());
        assert_eq!(listing.total_videos, 0);

        let err = delete_video(AxumState(ctx.state.clone()), Ok(AxumPath(id)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_keeps_files_another_record_still_lists() {
        let ctx = BackendTestContext::new().await;
        let first = ctx.insert_ready("abcdefghijk", Some("Some Title")).await;
        let second = ctx.insert_ready("abcdefghijk", Some("Some Title")).await;

        delete_video(AxumState(ctx.state.clone()), Ok(AxumPath(first)))
            .await
            .unwrap();

        let Json(listing) = ctx.list(None, None).await.unwrap();
        assert_eq!(
            listing.videos.iter().map(|video| video.id).collect::<Vec<_>>(),
            vec![second]
        );
        assert!(ctx.assets.join("abcdefghijk.mp4").is_file());
        assert!(ctx.assets.join("abcdefghijk.jpg").is_file());

        delete_video(AxumState(ctx.state.clone()), Ok(AxumPath(second)))
            .await
            .unwrap();
        assert!(!ctx.assets.join("abcdefghijk.mp4").exists());
        assert!(!ctx.assets.join("abcdefghijk.jpg").exists());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_files() {
        let ctx = BackendTestContext::new().await;
        let id = ctx.insert_ready("abcdefghijk", Some("Some Title")).await;
        std::fs::remove_file(ctx.assets.join("abcdefghijk.mp4")).unwrap();

        delete_video(AxumState(ctx.state.clone()), Ok(AxumPath(id)))
            .await
            .unwrap();
        assert!(ctx.store.get(id).await.unwrap().is_none());
        assert!(!ctx.assets.join("abcdefghijk.jpg").exists());
    }

    #[tokio::test]
    async fn legacy_delete_accepts_json_body() {
        let ctx = BackendTestContext::new().await;
        let keep = ctx.insert_ready("keepkeepkee", Some("Keep")).await;
        let id = ctx.insert_ready("abcdefghijk", Some("Drop")).await;

        legacy_delete(
            AxumState(ctx.state.clone()),
            Ok(Json(DeleteRequest { id })),
        )
        .await
        .unwrap();
        assert!(ctx.store.get(id).await.unwrap().is_none());
        assert!(ctx.store.get(keep).await.unwrap().is_some());

        let err = legacy_delete(
            AxumState(ctx.state.clone()),
            Ok(Json(DeleteRequest { id: 9999 })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_matches_substrings_literally() {
        let ctx = BackendTestContext::new().await;
        let cats = ctx.insert_ready("catscatscat", Some("Funny Cats 100%")).await;
        ctx.insert_ready("dogsdogsdog", Some("Dogs compilation")).await;
        let pending = ctx
            .store
            .insert_pending("https://example.com/pending")
            .await
            .unwrap();

        let hits = ctx.search("cats").await;
        assert_eq!(hits.total_videos, 1);
        assert_eq!(hits.videos[0].id, cats);

        assert_eq!(ctx.search("100%").await.total_videos, 1);
        assert_eq!(ctx.search("%").await.total_videos, 1);

        let none = ctx.search("zebra").await;
        assert!(none.videos.is_empty());
        assert_eq!(none.total_videos, 0);
        assert_eq!(none.total_pages, 0);

        // Untitled rows never match, even for the empty query.
        let everything = ctx.search("").await;
        assert_eq!(everything.total_videos, 2);
        assert!(everything.videos.iter().all(|video| video.id != pending));
    }

    #[tokio::test]
    async fn serve_asset_streams_whole_files_and_ranges() {
        let ctx = BackendTestContext::new().await;
        std::fs::write(ctx.assets.join("abcdefghijk.mp4"), b"0123456789").unwrap();

        let response = serve_asset(
            AxumState(ctx.state.clone()),
            AxumPath("abcdefghijk.mp4".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body_bytes(response).await, b"0123456789");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));
        let response = serve_asset(
            AxumState(ctx.state.clone()),
            AxumPath("abcdefghijk.mp4".into()),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(body_bytes(response).await, b"2345");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=50-"));
        let response = serve_asset(
            AxumState(ctx.state.clone()),
            AxumPath("abcdefghijk.mp4".into()),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn serve_asset_refuses_traversal_and_missing_files() {
        let ctx = BackendTestContext::new().await;
        let outside = ctx.assets.parent().unwrap().join("secret.txt");
        std::fs::write(&outside, b"secret").unwrap();
        std::fs::create_dir_all(ctx.assets.join("nested")).unwrap();

        for path in ["../secret.txt", "nested/../../secret.txt", "missing.mp4", "nested"] {
            let err = serve_asset(
                AxumState(ctx.state.clone()),
                AxumPath(path.into()),
                HeaderMap::new(),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn queue_stats_reflect_finished_jobs() {
        let ctx = BackendTestContext::new().await;
        let Json(response) = ctx
            .submit(Some("https://example.com/watch?v=abcdefghijk"))
            .await
            .unwrap();
        ctx.wait_until_settled(response.id).await;

        for _ in 0..500 {
            let Json(stats) = queue_stats(AxumState(ctx.state.clone())).await;
            if stats.completed == 1 {
                assert_eq!(stats.queued, 0);
                assert_eq!(stats.failed, 0);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("completed counter never advanced");
    }

    #[tokio::test]
    async fn router_maps_rejections_to_json_errors() {
        let ctx = BackendTestContext::new().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(ctx.state.clone())).await.unwrap();
        });

        let base = format!("http://{addr}");
        let results = tokio::task::spawn_blocking(move || {
            let status_and_body = |result: Result<ureq::Response, ureq::Error>| match result {
                Ok(response) => (response.status(), response.into_string().unwrap()),
                Err(ureq::Error::Status(code, response)) => (code, response.into_string().unwrap()),
                Err(err) => panic!("transport error: {err}"),
            };
            vec![
                status_and_body(
                    ureq::post(&format!("{base}/download"))
                        .set("Content-Type", "application/json")
                        .send_string("{not json"),
                ),
                status_and_body(ureq::get(&format!("{base}/video/abc")).call()),
                status_and_body(ureq::get(&format!("{base}/videos?page=two")).call()),
                status_and_body(ureq::get(&format!("{base}/video/42")).call()),
                status_and_body(ureq::get(&format!("{base}/nowhere")).call()),
                status_and_body(ureq::get(&format!("{base}/videos?page=1&page_size=5")).call()),
            ]
        })
        .await
        .unwrap();
        server.abort();

        let expected = [400, 400, 400, 404, 404, 200];
        for ((status, body), expected) in results.iter().zip(expected) {
            assert_eq!(*status, expected, "body: {body}");
            let json: Value = serde_json::from_str(body).unwrap();
            if expected == 200 {
                assert_eq!(json["page_size"], 5);
            } else {
                assert!(json["error"].is_string(), "body: {body}");
            }
        }
    }

    #[tokio::test]
    async fn store_errors_hide_their_details() {
        let err = ApiError::from_store(anyhow::anyhow!("SQLite failure: /srv/archive/videos.db"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");

        let body = body_bytes(err.into_response()).await;
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "internal error");
    }

    #[test]
    fn range_header_parsing() {
        let parse = |value: &'static str, size| {
            parse_range_header(&HeaderValue::from_static(value), size)
        };
        assert_eq!(parse("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse("bytes=-30", 10), Some((0, 9)));
        assert_eq!(parse("bytes=6-2", 10), None);
        assert_eq!(parse("items=0-4", 10), None);
        assert_eq!(parse("bytes=0-1,4-5", 10), None);
        assert_eq!(parse("bytes=-0", 10), None);
    }

    #[test]
    fn cli_flags_map_to_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--media-root",
            "/srv/archive",
            "--port",
            "8080",
            "--workers",
            "4",
            "--yt-dlp",
            "/opt/yt-dlp",
            "--env-file",
            "/etc/archive.env",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.media_root, Some(PathBuf::from("/srv/archive")));
        assert_eq!(overrides.archive_port, Some(8080));
        assert_eq!(overrides.workers, Some(4));
        assert_eq!(overrides.yt_dlp, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/archive.env")));
        assert!(overrides.archive_host.is_none());

        assert!(BackendArgs::try_parse_from(["backend", "--port", "nope"]).is_err());
    }

    #[test]
    fn host_must_be_an_ip_address() {
        assert!(parse_host_arg("0.0.0.0").is_ok());
        assert!(parse_host_arg(" ::1 ").is_ok());
        assert!(parse_host_arg("localhost").is_err());
    }

    #[test]
    fn url_validation_keeps_submitted_text() {
        assert_eq!(
            validate_source_url(Some("  https://example.com/watch?v=abcdefghijk ")).unwrap(),
            "https://example.com/watch?v=abcdefghijk"
        );
        assert!(validate_source_url(Some("https://")).is_err());
    }
}
