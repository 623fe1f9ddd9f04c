use std::error::Error as StdError;

use anyhow::Result;
use bytes::Bytes;
use const_format::formatcp;
use displaydoc::Display;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::version::ARREARS_DISTRIBUTOR;
use arrears::api::v1::operation::{
    CancelOperationResponse, OperationInfo, PageResponse, ProgressResponse, ResultsQuery,
};
use arrears::api::v1::upload::{
    CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest, InitiateUploadResponse,
    UploadChunkResponse, UploadStatus, ARREARS_CHUNK_HASH,
};
use arrears::api::{ApiEnvelope, ApiErrorBody, ApiErrorResponse, HealthResponse};
use arrears::hash::Hash;
use arrears::report::ReportKind;

/// The User-Agent string of Arrears.
const ARREARS_USER_AGENT: &str = formatcp!(
    "Arrears/{} ({})",
    env!("CARGO_PKG_VERSION"),
    ARREARS_DISTRIBUTOR
);

/// The Arrears API client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// Base endpoint of the server.
    endpoint: Url,

    /// An initialized HTTP client.
    client: HttpClient,
}

/// An API error.
#[derive(Debug, Display)]
pub enum ApiError {
    /// {1}
    Structured(StatusCode, ApiErrorBody),

    /// HTTP {0}: {1}
    Unstructured(StatusCode, String),
}

impl ApiClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            client: build_http_client()?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Opens an upload session.
    pub async fn initiate_upload(
        &self,
        request: &InitiateUploadRequest,
    ) -> Result<InitiateUploadResponse> {
        let endpoint = self.endpoint.join("_api/v1/uploads")?;

        self.send(self.client.post(endpoint).json(request)).await
    }

    /// Uploads one chunk of a session.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
        hash: &Hash,
    ) -> Result<UploadChunkResponse> {
        let endpoint = self.endpoint.join(&format!(
            "_api/v1/uploads/{}/chunks/{}",
            session_id, chunk_number
        ))?;

        let req = self
            .client
            .put(endpoint)
            .header(ARREARS_CHUNK_HASH, hash.to_typed_base16())
            .body(data);

        self.send(req).await
    }

    /// Assembles an upload and launches processing.
    pub async fn complete_upload(
        &self,
        session_id: &str,
        report: ReportKind,
    ) -> Result<CompleteUploadResponse> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/uploads/{}/complete", session_id))?;

        self.send(
            self.client
                .post(endpoint)
                .json(&CompleteUploadRequest { report }),
        )
        .await
    }

    /// Cancels an upload session.
    pub async fn cancel_upload(&self, session_id: &str) -> Result<()> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/uploads/{}", session_id))?;

        let res = self.client.delete(endpoint).send().await?;

        if res.status().is_success() {
            Ok(())
        } else {
            let api_error = ApiError::try_from_response(res).await?;
            Err(api_error.into())
        }
    }

    /// Returns the status of an upload session.
    pub async fn get_upload_status(&self, session_id: &str) -> Result<UploadStatus> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/uploads/{}", session_id))?;

        self.send(self.client.get(endpoint)).await
    }

    /// Returns the progress of an operation.
    ///
    /// With `wait`, the server holds the answer until something changes.
    pub async fn get_progress(
        &self,
        operation_id: &str,
        wait: Option<u64>,
    ) -> Result<ProgressResponse> {
        let mut endpoint = self
            .endpoint
            .join(&format!("_api/v1/operations/{}/progress", operation_id))?;

        if let Some(wait) = wait {
            endpoint
                .query_pairs_mut()
                .append_pair("wait", &wait.to_string());
        }

        self.send(self.client.get(endpoint)).await
    }

    /// Requests cancellation of an operation.
    pub async fn cancel_operation(&self, operation_id: &str) -> Result<CancelOperationResponse> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/operations/{}", operation_id))?;

        self.send(self.client.delete(endpoint)).await
    }

    /// Looks up a completed operation.
    pub async fn get_operation(&self, operation_id: &str) -> Result<OperationInfo> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/operations/{}", operation_id))?;

        self.send(self.client.get(endpoint)).await
    }

    /// Returns a page of an operation's result.
    pub async fn get_results(
        &self,
        operation_id: &str,
        query: &ResultsQuery,
    ) -> Result<PageResponse> {
        let endpoint = self
            .endpoint
            .join(&format!("_api/v1/operations/{}/results", operation_id))?;

        self.send(self.client.get(endpoint).query(query)).await
    }

    /// Checks that the server is up.
    pub async fn health(&self) -> Result<HealthResponse> {
        let endpoint = self.endpoint.join("health")?;

        self.send(self.client.get(endpoint)).await
    }

    /// Sends a request and unwraps the response envelope.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let res = req.send().await?;

        if res.status().is_success() {
            let envelope: ApiEnvelope<T> = res.json().await?;
            Ok(envelope.data)
        } else {
            let api_error = ApiError::try_from_response(res).await?;
            Err(api_error.into())
        }
    }
}

impl StdError for ApiError {}

impl ApiError {
    async fn try_from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str::<ApiErrorResponse>(&text) {
            Ok(s) => Ok(Self::Structured(status, s.error)),
            Err(_) => Ok(Self::Unstructured(status, text)),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Structured(status, _) | Self::Unstructured(status, _) => *status,
        }
    }

    /// Returns the machine-readable code of a structured error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Structured(_, body) => Some(&body.code),
            Self::Unstructured(..) => None,
        }
    }

    /// Returns whether repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        let status = self.status();
        status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
    }
}

fn build_http_client() -> Result<HttpClient> {
    let client = reqwest::Client::builder()
        .user_agent(ARREARS_USER_AGENT)
        .build()?;

    Ok(client)
}
