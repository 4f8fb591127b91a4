//! `process_document`: upload a PDF to PageIndex from a URL or local path.

use crate::result::{ErrorResponse, NextSteps};
use crate::schema::Validator;
use crate::ToolHandler;
use async_trait::async_trait;
use pageindex_client::{McpError, McpResult, RemoteCaller, RetryPolicy, ToolCallResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum document size (100MB).
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Timeout for downloads and uploads.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

const PDF_MIME: &str = "application/pdf";
const PDF_MAGIC: &[u8] = b"%PDF";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; PDF-Processor/1.0)";

const DESCRIPTION: &str = "Upload and process PDF documents from URLs or local files. Supports OCR \
processing, hierarchical content extraction, and intelligent document analysis. Returns a unique \
doc_id for subsequent operations. Processing typically takes 0-3 minutes depending on document \
size (estimate: 2 seconds per page). Supports files up to 100MB.";

#[derive(Debug, Error)]
enum DocumentError {
    #[error("Path is not a file: {0}")]
    NotAFile(String),

    #[error("File too large: {0} bytes (max: {MAX_FILE_SIZE} bytes)")]
    TooLarge(u64),

    #[error("File must be a PDF: {0}")]
    NotPdfName(String),

    #[error("Not a valid PDF file: {0}")]
    InvalidPdf(String),

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("PDF not found at the provided URL")]
    NotFound,

    #[error("Access denied - URL requires authentication or is blocked")]
    AccessDenied,

    #[error("Failed to retrieve PDF from {url}. Tried both original URL and {retry_url}")]
    ArxivRetryFailed { url: String, retry_url: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Remote(#[from] McpError),
}

impl DocumentError {
    /// Whether another download attempt could succeed.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => !((400..500).contains(status) && *status != 429),
            Self::Request(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Map client errors to friendlier messages.
    fn refine(self) -> Self {
        match self {
            Self::Http { status: 404, .. } => Self::NotFound,
            Self::Http { status: 403, .. } => Self::AccessDenied,
            other => other,
        }
    }

    fn next_steps(&self) -> NextSteps {
        match self {
            Self::InvalidPdf(_) => NextSteps::new(
                "The file is not a valid PDF document.",
                &[
                    "Verify the URL points directly to a PDF file, not a webpage",
                    "Check if the URL requires authentication or specific headers",
                    "Try accessing the URL in a browser to see what content it returns",
                ],
                "You can retry with a valid PDF URL",
            ),
            Self::ArxivRetryFailed { .. } => NextSteps::new(
                "Failed to retrieve PDF from arXiv. Both original URL and .pdf suffix were tried.",
                &[
                    "Verify the arXiv paper ID is correct (format: YYMM.NNNNN)",
                    "Try the direct PDF URL: https://arxiv.org/pdf/PAPER_ID.pdf",
                    "Check if the paper exists by visiting https://arxiv.org/abs/PAPER_ID",
                ],
                "You can retry with the correct arXiv URL format",
            ),
            _ => NextSteps::new(
                "PDF processing failed. Please check the file/URL and try again.",
                &[
                    "Ensure the file is a valid PDF",
                    "Check file size is under 100MB",
                    "Verify the URL is accessible (for remote files)",
                    "Try with a different PDF document",
                ],
                "You can retry with the same document, or try a different one",
            ),
        }
    }
}

/// A PDF ready for upload.
#[derive(Debug)]
struct PdfFile {
    name: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct UploadInfo {
    upload_url: Option<String>,
    file_name: Option<Value>,
}

/// Resolve a local path argument, accepting `file://` URLs.
fn resolve_local_path(input: &str) -> Result<PathBuf, DocumentError> {
    let path = if input.starts_with("file://") {
        url::Url::parse(input)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| DocumentError::InvalidUrl(input.to_string()))?
    } else {
        PathBuf::from(input)
    };

    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn read_local_pdf(input: &str) -> Result<PdfFile, DocumentError> {
    let path = resolve_local_path(input)?;
    let display = path.display().to_string();

    let meta = tokio::fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(DocumentError::NotAFile(display));
    }
    if meta.len() > MAX_FILE_SIZE {
        return Err(DocumentError::TooLarge(meta.len()));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !name.to_lowercase().ends_with(".pdf") {
        return Err(DocumentError::NotPdfName(name));
    }

    let bytes = tokio::fs::read(&path).await?;
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(DocumentError::InvalidPdf(name));
    }

    Ok(PdfFile { name, bytes })
}

/// File name from a `Content-Disposition` header value.
fn disposition_filename(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename")?;
    let (_, value) = rest.split_once('=')?;
    let value = value.split(';').next()?.trim();
    // RFC 5987 form: charset''name
    let value = value.rsplit_once("''").map_or(value, |(_, name)| name);
    let value = value.trim_matches(|c: char| c == '"' || c == '\'');
    (!value.is_empty()).then(|| value.to_string())
}

fn url_filename(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}

fn is_arxiv(url: &str) -> bool {
    url.contains("arxiv.org") && !url.ends_with(".pdf")
}

fn arxiv_retry_url(url: &str) -> String {
    if url.ends_with('/') {
        format!("{url}pdf")
    } else {
        format!("{url}.pdf")
    }
}

/// The local `process_document` tool.
pub struct ProcessDocumentTool {
    caller: Arc<dyn RemoteCaller>,
    http: reqwest::Client,
    validator: Validator,
    download_retry: RetryPolicy,
}

impl ProcessDocumentTool {
    pub fn new(caller: Arc<dyn RemoteCaller>) -> Self {
        Self {
            caller,
            http: reqwest::Client::new(),
            validator: Validator::from_schema(&Self::schema()),
            download_retry: RetryPolicy {
                retries: 3,
                min_delay: Duration::from_secs(2),
                factor: 2.0,
                max_delay: Duration::from_secs(10),
            },
        }
    }

    /// Override the download retry policy.
    pub fn with_download_retry(mut self, policy: RetryPolicy) -> Self {
        self.download_retry = policy;
        self
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "URL to a PDF document or local file path"
                }
            },
            "required": ["url"]
        })
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, DocumentError> {
        let response = self
            .http
            .get(url)
            .timeout(TRANSFER_TIMEOUT)
            .header(
                reqwest::header::ACCEPT,
                "application/pdf, application/octet-stream, */*",
            )
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DocumentError::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        Ok(response)
    }

    async fn download_once(&self, url: &str) -> Result<PdfFile, DocumentError> {
        let response = match self.fetch(url).await {
            Ok(response) => response,
            Err(e) if is_arxiv(url) => {
                let retry_url = arxiv_retry_url(url);
                info!(url, error = %e, "Retrying arXiv URL with .pdf suffix");
                self.fetch(&retry_url).await.map_err(|retry_err| {
                    warn!(url = %retry_url, error = %retry_err, "Retry with .pdf suffix failed");
                    DocumentError::ArxivRetryFailed {
                        url: url.to_string(),
                        retry_url: retry_url.clone(),
                    }
                })?
            }
            Err(e) => return Err(e),
        };

        if let Some(length) = response.content_length() {
            if length > MAX_FILE_SIZE {
                return Err(DocumentError::TooLarge(length));
            }
        }

        let headers = response.headers();
        let mut name = headers
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| url_filename(url));
        if !name.to_lowercase().ends_with(".pdf") {
            name.push_str(".pdf");
        }
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?.to_vec();
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(DocumentError::InvalidPdf(format!(
                "Got content-type: {}, filename: {name}",
                content_type.as_deref().unwrap_or("none")
            )));
        }

        if let Some(ct) = content_type.as_deref() {
            if !ct.contains("pdf") && !ct.contains("octet-stream") {
                warn!(content_type = ct, "Unexpected content-type, but PDF magic bytes validated");
            }
        }

        Ok(PdfFile { name, bytes })
    }

    async fn download(&self, url: &str) -> Result<PdfFile, DocumentError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.download_once(url).await {
                Ok(file) => return Ok(file),
                Err(e) => e.refine(),
            };

            let retries_left = self.download_retry.max_attempts().saturating_sub(attempt);
            if !error.is_retryable() || retries_left == 0 {
                return Err(error);
            }
            warn!(url, attempt, retries_left, error = %error, "PDF download attempt failed");
            tokio::time::sleep(self.download_retry.delay(attempt)).await;
        }
    }

    async fn upload(&self, file: &PdfFile) -> Result<Option<Value>, DocumentError> {
        let signed = self
            .caller
            .call(
                "get_signed_upload_url",
                json!({"fileName": file.name, "fileType": PDF_MIME}),
            )
            .await?;

        let text = signed.joined_text();
        if text.is_empty() {
            return Err(DocumentError::Upload(
                "Failed to get signed upload URL from remote server".to_string(),
            ));
        }
        let info: UploadInfo = serde_json::from_str(&text).map_err(|e| {
            DocumentError::Upload(format!("Unexpected upload URL response: {e}"))
        })?;
        let upload_url = info
            .upload_url
            .ok_or_else(|| DocumentError::Upload("No upload URL received from server".to_string()))?;

        debug!(file = %file.name, size = file.bytes.len(), "Uploading document");
        let response = self
            .http
            .put(&upload_url)
            .timeout(TRANSFER_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, PDF_MIME)
            .body(file.bytes.clone())
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(DocumentError::Upload(format!(
                "File upload failed with status {}",
                response.status().as_u16()
            )));
        }

        Ok(info.file_name)
    }

    async fn process(&self, url: &str) -> Result<ToolCallResult, DocumentError> {
        let url = url.trim();
        let is_remote = url.starts_with("http://") || url.starts_with("https://");
        let file = if is_remote {
            self.download(url).await?
        } else {
            read_local_pdf(url).await?
        };

        let file_name = self.upload(&file).await?;
        info!(file = %file.name, "Document uploaded, submitting");

        Ok(self
            .caller
            .call("submit_document", json!({"file_name": file_name}))
            .await?)
    }
}

#[async_trait]
impl ToolHandler for ProcessDocumentTool {
    fn name(&self) -> &str {
        "process_document"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        Self::schema()
    }

    fn validator(&self) -> &Validator {
        &self.validator
    }

    async fn execute(&self, params: Value) -> McpResult<ToolCallResult> {
        let url = params.get("url").and_then(Value::as_str).unwrap_or_default();

        match self.process(url).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(error = %e, "process_document failed");
                Ok(ErrorResponse::new(e.to_string())
                    .next_steps(e.next_steps())
                    .into_result())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockCaller;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PDF: &[u8] = b"%PDF-1.7\n%fake\n";

    fn error_body(result: &ToolCallResult) -> Value {
        assert!(result.is_error);
        serde_json::from_str(&result.joined_text()).unwrap()
    }

    fn unused_caller() -> Arc<dyn RemoteCaller> {
        let mut caller = MockCaller::new();
        caller.expect_call().never();
        Arc::new(caller)
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="paper.pdf""#).as_deref(),
            Some("paper.pdf")
        );
        assert_eq!(
            disposition_filename("attachment; filename=report.pdf; size=1").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            disposition_filename("attachment; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf").as_deref(),
            Some("r%C3%A9sum%C3%A9.pdf")
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn test_arxiv_helpers() {
        assert!(is_arxiv("https://arxiv.org/abs/2401.00001"));
        assert!(!is_arxiv("https://arxiv.org/pdf/2401.00001.pdf"));
        assert_eq!(
            arxiv_retry_url("https://arxiv.org/pdf/2401.00001"),
            "https://arxiv.org/pdf/2401.00001.pdf"
        );
        assert_eq!(arxiv_retry_url("https://x.org/abs/"), "https://x.org/abs/pdf");
    }

    #[test]
    fn test_retry_classification() {
        let http = |status| DocumentError::Http {
            status,
            reason: String::new(),
        };
        assert!(!http(400).is_retryable());
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!DocumentError::InvalidPdf("x".into()).is_retryable());
        assert!(matches!(http(404).refine(), DocumentError::NotFound));
    }

    #[tokio::test]
    async fn test_local_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ProcessDocumentTool::new(unused_caller());

        let missing = dir.path().join("missing.pdf");
        let result = tool
            .execute(json!({"url": missing.to_string_lossy()}))
            .await
            .unwrap();
        assert!(error_body(&result)["error"]
            .as_str()
            .unwrap()
            .starts_with("IO error"));

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, PDF).unwrap();
        let result = tool
            .execute(json!({"url": text.to_string_lossy()}))
            .await
            .unwrap();
        assert_eq!(error_body(&result)["error"], "File must be a PDF: notes.txt");

        let fake = dir.path().join("fake.pdf");
        std::fs::write(&fake, b"hello").unwrap();
        let url = format!("file://{}", fake.display());
        let result = tool.execute(json!({"url": url})).await.unwrap();
        let body = error_body(&result);
        assert_eq!(body["error"], "Not a valid PDF file: fake.pdf");
        assert_eq!(
            body["next_steps"]["immediate"],
            "The file is not a valid PDF document."
        );
    }

    #[tokio::test]
    async fn test_local_upload_flow() {
        let storage = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload/paper.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&storage)
            .await;

        let upload_url = format!("{}/upload/paper.pdf", storage.uri());
        let mut caller = MockCaller::new();
        caller.expect_call().times(2).returning(move |name, params| {
            match name {
                "get_signed_upload_url" => {
                    assert_eq!(params["fileName"], "paper.pdf");
                    assert_eq!(params["fileType"], PDF_MIME);
                    Ok(ToolCallResult::text(
                        json!({"upload_url": upload_url, "file_name": "stored-paper.pdf"})
                            .to_string(),
                    ))
                }
                "submit_document" => {
                    assert_eq!(params["file_name"], "stored-paper.pdf");
                    Ok(ToolCallResult::text(r#"{"doc_id":"pi-123"}"#))
                }
                other => panic!("unexpected call {other}"),
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("paper.pdf");
        std::fs::write(&file, PDF).unwrap();

        let tool = ProcessDocumentTool::new(Arc::new(caller));
        let result = tool
            .execute(json!({"url": file.to_string_lossy()}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), r#"{"doc_id":"pi-123"}"#);
    }

    #[tokio::test]
    async fn test_failed_upload_is_error_result() {
        let storage = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&storage)
            .await;

        let upload_url = format!("{}/upload", storage.uri());
        let mut caller = MockCaller::new();
        caller.expect_call().times(1).returning(move |_, _| {
            Ok(ToolCallResult::text(json!({"upload_url": upload_url}).to_string()))
        });

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pdf");
        std::fs::write(&file, PDF).unwrap();

        let tool = ProcessDocumentTool::new(Arc::new(caller));
        let result = tool
            .execute(json!({"url": file.to_string_lossy()}))
            .await
            .unwrap();
        assert_eq!(
            error_body(&result)["error"],
            "File upload failed with status 403"
        );
    }

    #[tokio::test]
    async fn test_download_uses_disposition_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", r#"attachment; filename="report""#)
                    .set_body_raw(PDF, PDF_MIME),
            )
            .mount(&server)
            .await;

        let tool = ProcessDocumentTool::new(unused_caller());
        let file = tool
            .download(&format!("{}/files/123", server.uri()))
            .await
            .unwrap();
        assert_eq!(file.name, "report.pdf");
        assert_eq!(file.bytes, PDF);
    }

    #[tokio::test]
    async fn test_download_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tool = ProcessDocumentTool::new(unused_caller());
        let err = tool
            .download(&format!("{}/missing.pdf", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "PDF not found at the provided URL");
    }

    #[tokio::test]
    async fn test_download_server_error_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let tool = ProcessDocumentTool::new(unused_caller()).with_download_retry(RetryPolicy {
            retries: 1,
            min_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_millis(10),
        });
        let err = tool
            .download(&format!("{}/doc.pdf", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
    }

    #[tokio::test]
    async fn test_non_pdf_download_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tool = ProcessDocumentTool::new(unused_caller());
        let err = tool
            .download(&format!("{}/page", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not a valid PDF file: Got content-type: text/html, filename: page.pdf"
        );
    }
}
