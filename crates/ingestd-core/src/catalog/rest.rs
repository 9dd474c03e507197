//! Butler REST catalog client.

use super::rest_api::{self, ErrorResponse, RawFailureStage};
use super::{
    Catalog, CatalogHealth, CatalogResult, DatasetRef, DatasetType, FileDataset,
    RawIngestObserver, TransferMode,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::{ButlerConfig, CatalogType};
use crate::{CatalogError, Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// REST API base URI
    pub base_uri: String,
    /// Repository served by the endpoint
    pub repo: String,
    /// Bearer token
    pub bearer_token: Option<String>,
}

/// Client for a Butler server.
pub struct RestCatalogClient {
    client: Client,
    config: RestClientConfig,
    circuit_breaker: CircuitBreaker,
}

impl RestCatalogClient {
    /// Create a client for the repository described by `config`.
    pub fn new(config: &ButlerConfig, rest_uri: &str) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let circuit_breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("butler-rest")
                .with_failure_threshold(5)
                .with_reset_timeout(Duration::from_secs(30))
                .with_success_threshold(2),
        );

        info!(uri = %rest_uri, repo = %config.repo, "REST catalog client initialized");

        Ok(Self {
            client,
            config: RestClientConfig {
                base_uri: rest_uri.trim_end_matches('/').to_string(),
                repo: config.repo.clone(),
                bearer_token: config.credential.clone(),
            },
            circuit_breaker,
        })
    }

    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_uri, path);
        let mut request = self
            .client
            .request(method, &url)
            .header("Accept", "application/json")
            .header("X-Butler-Repository", &self.config.repo);

        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        request
    }

    async fn execute_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> CatalogResult<reqwest::Response> {
        if !self.circuit_breaker.is_allowed() {
            warn!("Circuit breaker is open, rejecting request");
            return Err(CatalogError::Connection(
                "Circuit breaker is open - catalog operations temporarily blocked".into(),
            ));
        }

        match request.send().await {
            Ok(response) => {
                if response.status().is_server_error() {
                    self.circuit_breaker.record_failure();
                } else {
                    self.circuit_breaker.record_success();
                }
                Ok(response)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                Err(CatalogError::Connection(e.to_string()))
            }
        }
    }

    /// Send `request` and decode a successful JSON body.
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> CatalogResult<T> {
        let response = self.execute_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_error_response(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| CatalogError::other(format!("Invalid catalog response: {}", e)))
    }

    /// Send `request` and discard the body of a successful response.
    async fn call_empty(&self, request: reqwest::RequestBuilder) -> CatalogResult<()> {
        let response = self.execute_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_error_response(status, &body));
        }
        Ok(())
    }

    /// POST a registration, treating 409 as "already exists".
    async fn register<B>(&self, path: &str, body: &B) -> CatalogResult<bool>
    where
        B: serde::Serialize + Sync,
    {
        let request = self.build_request(Method::POST, path).json(body);
        let response = self.execute_request(request).await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_error_response(status, &body));
        }

        let created: rest_api::RegisterResponse = response
            .json()
            .await
            .unwrap_or(rest_api::RegisterResponse { created: true });
        Ok(created.created)
    }
}

/// Map an error body to a [`CatalogError`], keeping nested causes as the source chain.
pub(crate) fn handle_error_response(status: StatusCode, body: &str) -> CatalogError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => error_from_response(status, response),
        Err(_) => CatalogError::Request {
            status: status.as_u16(),
            message: body.to_string(),
        },
    }
}

fn error_from_response(status: StatusCode, response: ErrorResponse) -> CatalogError {
    // Flatten the chain, then rebuild it from the innermost cause outwards
    let mut chain = vec![response];
    while chain.len() < crate::error::MAX_CAUSE_DEPTH {
        let Some(cause) = chain.last_mut().and_then(|r| r.cause.take()) else {
            break;
        };
        chain.push(*cause);
    }

    let mut error: Option<CatalogError> = None;
    while let Some(response) = chain.pop() {
        error = Some(convert_error(status, response, error));
    }
    error.unwrap_or_else(|| CatalogError::other("empty error response"))
}

fn convert_error(
    status: StatusCode,
    response: ErrorResponse,
    cause: Option<CatalogError>,
) -> CatalogError {
    match response.error_type.as_str() {
        "MissingDatasetTypeError" | "DatasetTypeError" => CatalogError::MissingDatasetType {
            name: response.name.unwrap_or(response.message),
        },
        "MissingCollectionError" => CatalogError::MissingCollection {
            run: response.run.or(response.name).unwrap_or(response.message),
        },
        "ConflictingDefinitionError" => CatalogError::ConflictingDefinition(response.message),
        "FileNotFoundError" | "OSError" => CatalogError::FileUnreadable {
            path: response.path.unwrap_or_default(),
            message: response.message,
        },
        _ => match cause {
            Some(cause) => CatalogError::caused_by(
                format!("{}: {}", response.error_type, response.message),
                cause,
            ),
            None => CatalogError::Request {
                status: status.as_u16(),
                message: format!("{}: {}", response.error_type, response.message),
            },
        },
    }
}

#[async_trait]
impl Catalog for RestCatalogClient {
    async fn health_check(&self) -> CatalogResult<CatalogHealth> {
        let start = Instant::now();
        let request = self.build_request(Method::GET, "/v1/health");

        let health = match request.send().await {
            Ok(response) => {
                let status = response.status();
                let is_healthy = status.is_success();
                let message = if is_healthy {
                    let version = response
                        .json::<rest_api::HealthResponse>()
                        .await
                        .ok()
                        .and_then(|h| h.version);
                    match version {
                        Some(v) => format!(
                            "Butler server {} at {} is healthy",
                            v, self.config.base_uri
                        ),
                        None => format!("Butler server at {} is healthy", self.config.base_uri),
                    }
                } else {
                    format!("Butler server returned status: {}", status)
                };
                CatalogHealth {
                    is_healthy,
                    response_time_ms: start.elapsed().as_millis() as u64,
                    message: Some(message),
                    catalog_type: CatalogType::Rest,
                }
            }
            Err(e) => CatalogHealth {
                is_healthy: false,
                response_time_ms: start.elapsed().as_millis() as u64,
                message: Some(format!("Connection failed: {}", e)),
                catalog_type: CatalogType::Rest,
            },
        };

        Ok(health)
    }

    async fn bulk_register(
        &self,
        datasets: &[FileDataset],
        transfer: TransferMode,
    ) -> CatalogResult<()> {
        let body = rest_api::BulkIngestRequest {
            datasets: datasets.to_vec(),
            transfer,
        };
        let request = self
            .build_request(Method::POST, "/v1/datasets/ingest")
            .json(&body);
        self.call_empty(request).await?;

        debug!(datasets = datasets.len(), %transfer, "Bulk registration accepted");
        Ok(())
    }

    async fn register_dataset_type(&self, dataset_type: &DatasetType) -> CatalogResult<bool> {
        let body: &rest_api::RegisterDatasetTypeRequest = dataset_type;
        self.register("/v1/dataset-types", body).await
    }

    async fn register_run(&self, run: &str) -> CatalogResult<bool> {
        let body = rest_api::RegisterRunRequest {
            name: run.to_string(),
        };
        self.register("/v1/runs", &body).await
    }

    async fn get_dataset(&self, id: Uuid) -> CatalogResult<Option<DatasetRef>> {
        let request = self.build_request(Method::GET, &format!("/v1/datasets/{}", id));
        match self.call(request).await {
            Ok(dataset_ref) => Ok(Some(dataset_ref)),
            Err(CatalogError::Request { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_dataset_type(&self, name: &str) -> CatalogResult<Option<DatasetType>> {
        let path = format!("/v1/dataset-types/{}", urlencoding::encode(name));
        let request = self.build_request(Method::GET, &path);
        match self.call(request).await {
            Ok(dataset_type) => Ok(Some(dataset_type)),
            Err(CatalogError::Request { status: 404, .. })
            | Err(CatalogError::MissingDatasetType { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_raw_ingest(
        &self,
        paths: &[String],
        transfer: TransferMode,
        observer: &dyn RawIngestObserver,
    ) -> CatalogResult<()> {
        let body = rest_api::RawIngestRequest {
            files: paths.to_vec(),
            transfer,
        };
        let request = self.build_request(Method::POST, "/v1/raw/ingest").json(&body);
        let response: rest_api::RawIngestResponse = self.call(request).await?;

        for failure in response.failures {
            let error = error_from_response(StatusCode::UNPROCESSABLE_ENTITY, failure.error);
            match failure.stage {
                RawFailureStage::Metadata => {
                    for path in &failure.files {
                        observer.on_metadata_failure(path, &error);
                    }
                }
                RawFailureStage::Ingest => observer.on_ingest_failure(&failure.files, &error),
            }
        }

        if !response.succeeded.is_empty() {
            observer.on_success(&response.succeeded);
        }
        Ok(())
    }

    async fn import_dimension_file(&self, path: &str) -> CatalogResult<()> {
        let body = rest_api::PathRequest {
            path: path.to_string(),
        };
        let request = self
            .build_request(Method::POST, "/v1/dimensions/import")
            .json(&body);
        self.call_empty(request).await
    }

    async fn ingest_archive(&self, path: &str, transfer: TransferMode) -> CatalogResult<()> {
        let body = rest_api::ArchiveIngestRequest {
            path: path.to_string(),
            transfer,
        };
        let request = self
            .build_request(Method::POST, "/v1/archives/ingest")
            .json(&body);
        self.call_empty(request).await
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Rest
    }

    fn repo(&self) -> &str {
        &self.config.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::extract_cause;

    #[test]
    fn test_missing_dataset_type_mapping() {
        let body = r#"{"type": "MissingDatasetTypeError", "code": 404, "message": "unknown", "name": "calexp"}"#;
        let err = handle_error_response(StatusCode::NOT_FOUND, body);
        assert!(matches!(err, CatalogError::MissingDatasetType { ref name } if name == "calexp"));
    }

    #[test]
    fn test_missing_collection_mapping() {
        let body = r#"{"type": "MissingCollectionError", "code": 404, "message": "no run", "run": "HSC/runs/a"}"#;
        let err = handle_error_response(StatusCode::NOT_FOUND, body);
        assert!(matches!(err, CatalogError::MissingCollection { ref run } if run == "HSC/runs/a"));
    }

    #[test]
    fn test_nested_cause_becomes_source_chain() {
        let body = r#"{
            "type": "RuntimeError", "code": 500, "message": "ingest failed",
            "cause": {"type": "FileNotFoundError", "code": 500, "message": "No such file", "path": "/data/a.fits"}
        }"#;
        let err = handle_error_response(StatusCode::INTERNAL_SERVER_ERROR, body);

        assert!(!err.is_repairable());
        assert_eq!(
            extract_cause(&err),
            "RuntimeError: ingest failed; Cannot read /data/a.fits: No such file"
        );
    }

    #[test]
    fn test_unparseable_body() {
        let err = handle_error_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, CatalogError::Request { status: 502, .. }));
    }
}
