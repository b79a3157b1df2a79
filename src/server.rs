//! HTTP server for likeness-db
//!
//! # Endpoints
//!
//! - `POST /api/upload` - Register a reference image (multipart field `file`)
//! - `POST /api/find_similar?k=5` - Nearest registered images to an uploaded one
//! - `GET /api/stats` - Index statistics
//! - `GET /health` - Readiness and size
//! - `GET /static/images/*` - Registered images

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use likeness_core::IndexError;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::coordinator::{Coordinator, CoordinatorError, CoordinatorStats, PersistenceWarning};

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    /// Name the image was stored under
    pub filename: String,
    /// Identifier, also the path the image is served from
    pub path: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_warning: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FindParams {
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SimilarImage {
    pub path: String,
    pub distance: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindResponse {
    pub message: String,
    pub results: Vec<SimilarImage>,
    pub query_time_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ready: bool,
    pub vectors: usize,
    pub dim: usize,
    pub strategy: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            CoordinatorError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
            CoordinatorError::EmptyIndex => (StatusCode::NOT_FOUND, "empty_index"),
            CoordinatorError::Index(IndexError::OutOfRange { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
            CoordinatorError::Index(_) => (StatusCode::BAD_REQUEST, "invalid_vector"),
            CoordinatorError::Embed(_) => (StatusCode::BAD_REQUEST, "unsupported_image"),
            CoordinatorError::AlreadyStarted
            | CoordinatorError::Snapshot(_)
            | CoordinatorError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        error_response(status, code, self.to_string())
    }
}

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// Pull the `file` part out of a multipart body
async fn read_file_field(multipart: &mut Multipart) -> Result<Upload, Response> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "missing_file",
                    "No file part in the request",
                ))
            }
            Err(e) => {
                return Err(error_response(StatusCode::BAD_REQUEST, "bad_multipart", e.to_string()))
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "unsupported_media",
                format!("Expected an image upload, got content type '{}'", content_type),
            ));
        }
        let file_name = field
            .file_name()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("upload")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, "bad_multipart", e.to_string()))?;
        if bytes.is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "missing_file",
                "No selected file",
            ));
        }
        return Ok(Upload {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
}

/// Run a blocking coordinator call off the async workers
async fn blocking<T, F>(coordinator: &Arc<Coordinator>, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&Coordinator) -> Result<T, CoordinatorError> + Send + 'static,
{
    let coordinator = coordinator.clone();
    match tokio::task::spawn_blocking(move || f(&coordinator)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into_response()),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("worker failed: {}", e),
        )),
    }
}

/// POST /api/upload - Store, embed and index an image
async fn upload(State(coordinator): State<Arc<Coordinator>>, mut multipart: Multipart) -> Response {
    let upload = match read_file_field(&mut multipart).await {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };

    let outcome = match blocking(&coordinator, move |c| {
        c.register_image(&upload.file_name, &upload.bytes)
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(resp) => return resp,
    };

    let filename = outcome
        .identifier
        .rsplit('/')
        .next()
        .unwrap_or(outcome.identifier.as_str())
        .to_string();
    let response = UploadResponse {
        message: "Image uploaded and indexed".to_string(),
        filename,
        path: outcome.identifier.clone(),
        position: outcome.position,
        persistence_warning: outcome.warning.as_ref().map(PersistenceWarning::to_string),
    };
    (StatusCode::CREATED, Json(response)).into_response()
}

/// POST /api/find_similar - Query with an uploaded image
async fn find_similar(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<FindParams>,
    mut multipart: Multipart,
) -> Response {
    if params.k == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid_k", "k must be > 0");
    }
    let upload = match read_file_field(&mut multipart).await {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };

    let start = Instant::now();
    let k = params.k;
    let matches = match blocking(&coordinator, move |c| c.find_similar(&upload.bytes, k)).await {
        Ok(matches) => matches,
        Err(resp) => return resp,
    };
    let query_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    let response = FindResponse {
        message: "Similar images found".to_string(),
        results: matches
            .into_iter()
            .map(|m| SimilarImage {
                path: m.identifier,
                distance: m.distance,
            })
            .collect(),
        query_time_ms,
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// GET /api/stats
async fn stats(State(coordinator): State<Arc<Coordinator>>) -> Json<CoordinatorStats> {
    Json(coordinator.stats())
}

/// GET /health
async fn health(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let stats = coordinator.stats();
    let ready = coordinator.is_ready();
    let response = HealthResponse {
        status: if ready { "ok" } else { "starting" }.to_string(),
        ready,
        vectors: stats.vectors,
        dim: stats.dim,
        strategy: stats.strategy.to_string(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Create the axum router
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let images = ServeDir::new(&coordinator.config().images_dir);
    let body_limit = coordinator.config().max_upload_bytes;

    Router::new()
        .route("/api/upload", post(upload))
        .route("/api/find_similar", post(find_similar))
        .route("/api/stats", get(stats))
        .route("/health", get(health))
        .nest_service("/static/images", images)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(coordinator)
}

/// Serve until ctrl-c, then flush a final snapshot
pub async fn serve(coordinator: Arc<Coordinator>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let router = create_router(coordinator.clone());

    tracing::info!("Starting likeness-db server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    match tokio::task::spawn_blocking(move || coordinator.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "final snapshot failed"),
        Err(e) => tracing::warn!(error = %e, "final snapshot task failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use axum::body::Body;
    use axum::http::Request;
    use likeness_core::ByteHistogramEmbedder;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "likenessboundary";

    fn png(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn multipart_body(file_name: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(uri: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(file_name, content_type, bytes)))
            .unwrap()
    }

    fn create_test_state(start: bool) -> (TempDir, Arc<Coordinator>) {
        let dir = tempdir().unwrap();
        let config = ServiceConfig::from_data_dir(dir.path().to_path_buf(), 32);
        let coordinator = Arc::new(Coordinator::new(
            config,
            Arc::new(ByteHistogramEmbedder::new(32)),
        ));
        if start {
            coordinator.start().unwrap();
        }
        (dir, coordinator)
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);

        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = json_body(response).await;
        assert!(health.ready);
        assert_eq!(health.dim, 32);
        assert_eq!(health.strategy, "flat");
    }

    #[tokio::test]
    async fn test_not_ready_is_unavailable() {
        let (_dir, coordinator) = create_test_state(false);
        let router = create_router(coordinator);
        let response = router
            .oneshot(multipart_request("/api/upload", "a.png", "image/png", &png(b"a")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let err: ErrorResponse = json_body(response).await;
        assert_eq!(err.code, "not_ready");
    }

    #[tokio::test]
    async fn test_upload_then_find_similar() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);

        let cat = png(b"tabby tabby tabby tabby");
        let dog = png(&[7u8; 300]);

        let response = router
            .clone()
            .oneshot(multipart_request("/api/upload", "cat.png", "image/png", &cat))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let uploaded: UploadResponse = json_body(response).await;
        assert_eq!(uploaded.position, 0);
        assert!(uploaded.path.starts_with("static/images/"));
        assert!(uploaded.filename.ends_with("_cat.png"));
        assert!(uploaded.persistence_warning.is_none());

        let response = router
            .clone()
            .oneshot(multipart_request("/api/upload", "dog.png", "image/png", &dog))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(multipart_request("/api/find_similar?k=2", "q.png", "image/png", &cat))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let found: FindResponse = json_body(response).await;
        assert_eq!(found.results.len(), 2);
        assert_eq!(found.results[0].path, uploaded.path);
        assert_eq!(found.results[0].distance, 0.0);
        assert!(found.results[1].distance > 0.0);

        // the stored image is served back under its identifier
        let request = Request::builder()
            .method("GET")
            .uri(format!("/{}", uploaded.path))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let served = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(served.as_ref(), cat.as_slice());
    }

    #[tokio::test]
    async fn test_find_similar_on_empty_index() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);
        let response = router
            .oneshot(multipart_request("/api/find_similar", "q.png", "image/png", &png(b"q")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let err: ErrorResponse = json_body(response).await;
        assert_eq!(err.code, "empty_index");
    }

    #[tokio::test]
    async fn test_find_similar_rejects_zero_k() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);
        let response = router
            .oneshot(multipart_request("/api/find_similar?k=0", "q.png", "image/png", &png(b"q")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image_content_type() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator.clone());
        let response = router
            .oneshot(multipart_request("/api/upload", "notes.txt", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = json_body(response).await;
        assert_eq!(err.code, "unsupported_media");
        assert_eq!(coordinator.stats().vectors, 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_undecodable_image() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);
        let response = router
            .oneshot(multipart_request("/api/upload", "fake.png", "image/png", b"GIF89a...."))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = json_body(response).await;
        assert_eq!(err.code, "unsupported_image");
    }

    #[tokio::test]
    async fn test_upload_without_file_part() {
        let (_dir, coordinator) = create_test_state(true);
        let router = create_router(coordinator);
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = json_body(response).await;
        assert_eq!(err.code, "missing_file");
    }
}
