//! Server test utilities.

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_core::{SignatureTable, UploadMetadata};
use stowage_server::worker::{
    CompletionProcessor, CompletionWorker, JobStatusBoard, MemoryQueue, MemoryRecordStore,
};
use stowage_server::{AppState, create_router};
use stowage_storage::StorageTiers;
use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub queue: Arc<MemoryQueue>,
    _temp_dir: TempDir,
}

/// A buffered response.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary filesystem storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");

        let mut config = AppConfig::for_testing(&storage_path);
        modifier(&mut config);

        let tiers = StorageTiers::from_config(&config.storage)
            .await
            .expect("Failed to create storage backends");
        let queue = Arc::new(MemoryQueue::new());
        let state = AppState::new(
            config,
            tiers,
            Arc::new(SignatureTable::builtin()),
            queue.clone(),
            JobStatusBoard::new(),
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            queue,
            _temp_dir: temp_dir,
        }
    }

    /// Start a completion worker pool against this server's queue.
    pub fn spawn_worker(
        &self,
        records: Arc<MemoryRecordStore>,
    ) -> (CancellationToken, JoinSet<()>) {
        let processor = Arc::new(CompletionProcessor::new(
            self.state.tiers.clone(),
            records,
            self.state.signatures.clone(),
            self.state.config.worker.clone(),
            self.state.statuses.clone(),
        ));
        let shutdown = CancellationToken::new();
        let workers = CompletionWorker::new(self.queue.clone(), processor, 2).spawn(shutdown.clone());
        (shutdown, workers)
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// POST /v1/uploads
    pub async fn create_upload(&self, length: u64, metadata: &UploadMetadata) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/uploads")
            .header("Upload-Length", length.to_string())
            .header("Upload-Metadata", metadata.to_header())
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Create an upload and return its path.
    pub async fn open_upload(&self, length: u64, metadata: &UploadMetadata) -> String {
        let response = self.create_upload(length, metadata).await;
        assert_eq!(response.status, StatusCode::CREATED);
        response
            .header("location")
            .expect("Location header")
            .to_string()
    }

    /// PATCH one chunk.
    pub async fn patch(&self, location: &str, offset: u64, chunk: Bytes) -> TestResponse {
        let request = Request::builder()
            .method("PATCH")
            .uri(location)
            .header("Upload-Offset", offset.to_string())
            .header("Content-Type", "application/offset+octet-stream")
            .body(Body::from(chunk))
            .unwrap();
        self.send(request).await
    }

    /// PATCH `data` in chunks of `chunk_size`.
    pub async fn upload_all(&self, location: &str, data: &Bytes, chunk_size: usize) {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let response = self
                .patch(location, offset as u64, data.slice(offset..end))
                .await;
            assert_eq!(response.status, StatusCode::NO_CONTENT);
            offset = end;
        }
    }

    pub async fn head(&self, location: &str) -> TestResponse {
        let request = Request::builder()
            .method("HEAD")
            .uri(location)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn finalize(&self, location: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(format!("{location}/finalize"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn delete(&self, location: &str) -> TestResponse {
        let request = Request::builder()
            .method("DELETE")
            .uri(location)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        self.send(request).await
    }
}

/// Attach a connection address, as `into_make_service_with_connect_info` would.
#[allow(dead_code)]
pub fn from_client(mut request: Request<Body>, addr: &str) -> Request<Body> {
    let addr: SocketAddr = addr.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}
