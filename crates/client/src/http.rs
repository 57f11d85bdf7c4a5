//! HTTP transport for the intake server.

use crate::error::{ClientError, Result};
use crate::transport::{FinalizeReceipt, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use stowage_core::UploadMetadata;

const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a non-success response.
#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a reference (absolute URL or server path) against the base URL.
    fn url(&self, reference: &str) -> Result<Url> {
        self.base_url
            .join(reference)
            .map_err(|e| ClientError::InvalidUrl(format!("{reference}: {e}")))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.timeout(self.timeout);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response> {
        self.authorize(req).send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(self.timeout)
            } else {
                ClientError::Http(e)
            }
        })
    }

    /// Execute and turn any non-success status into [`ClientError::Status`].
    async fn execute_ok(&self, req: RequestBuilder) -> Result<Response> {
        let response = self.execute(req).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response).await)
        }
    }
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    // Only the delay-seconds form is honoured.
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs);
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Status {
            status,
            code: body.code,
            message: body.message.unwrap_or_default(),
            retry_after,
        },
        Err(_) => ClientError::Status {
            status,
            code: None,
            message: text,
            retry_after,
        },
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ClientError::Protocol(format!("response is missing a valid {name} header")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create(&self, metadata: &UploadMetadata, size: u64) -> Result<String> {
        let url = self.url("/v1/uploads")?;
        let response = self
            .execute_ok(
                self.http
                    .post(url)
                    .header(UPLOAD_LENGTH, size)
                    .header(UPLOAD_METADATA, metadata.to_header()),
            )
            .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::Protocol("create response has no Location".to_string()))?;
        let reference = self.url(location)?;
        tracing::debug!(upload = %reference, size, "created upload");
        Ok(reference.to_string())
    }

    async fn send_chunk(&self, reference: &str, offset: u64, chunk: Bytes) -> Result<u64> {
        let url = self.url(reference)?;
        let response = self
            .execute(
                self.http
                    .patch(url)
                    .header(UPLOAD_OFFSET, offset)
                    .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
                    .body(chunk),
            )
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let error = status_error(response).await;
            if let ClientError::Status {
                code: Some(code), ..
            } = &error
                && code == "offset_mismatch"
            {
                let server = self.get_offset(reference).await?;
                return Err(ClientError::OffsetMismatch {
                    sent: offset,
                    server,
                });
            }
            return Err(error);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        header_u64(response.headers(), UPLOAD_OFFSET)
    }

    async fn get_offset(&self, reference: &str) -> Result<u64> {
        let url = self.url(reference)?;
        let response = self.execute_ok(self.http.head(url)).await?;
        header_u64(response.headers(), UPLOAD_OFFSET)
    }

    async fn finalize(&self, reference: &str) -> Result<FinalizeReceipt> {
        let url = self.url(&format!("{}/finalize", reference.trim_end_matches('/')))?;
        let response = self.execute_ok(self.http.post(url)).await?;
        Ok(response.json().await?)
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        let url = self.url(reference)?;
        let response = self.execute(self.http.delete(url)).await?;
        // Already gone counts as discarded.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response).await)
    }
}
