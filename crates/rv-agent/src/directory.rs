//! HTTP client for the directory (provisioning) service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rv_core::error::DirectoryError;
use rv_core::traits::DirectoryService;
use rv_core::Registration;

#[derive(Debug, Deserialize)]
struct LookupResponse {
    endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    host: Option<&'a str>,
    zone: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    endpoint: String,
    hostname: String,
    uid: String,
}

/// [`DirectoryService`] speaking JSON over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpDirectoryService {
    client: reqwest::Client,
}

impl HttpDirectoryService {
    /// Create a client with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client around an existing `reqwest::Client`
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn request_error(e: reqwest::Error) -> DirectoryError {
    DirectoryError::Request(e.to_string())
}

#[async_trait]
impl DirectoryService for HttpDirectoryService {
    async fn lookup_host(&self, load_balancer_url: &str) -> Result<Option<String>, DirectoryError> {
        let response = self
            .client
            .get(load_balancer_url)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let body: LookupResponse = response.json().await.map_err(request_error)?;
        Ok(body.endpoint.filter(|e| !e.is_empty()))
    }

    async fn register_host(
        &self,
        api_url: &str,
        host: Option<&str>,
        zone: &str,
    ) -> Result<Registration, DirectoryError> {
        let url = format!("{}/endpoint", api_url.trim_end_matches('/'));
        tracing::debug!("Registering host with directory at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&RegisterRequest { host, zone })
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let body: RegisterResponse = response.json().await.map_err(request_error)?;
        if body.endpoint.is_empty() {
            return Err(DirectoryError::EmptyEndpoint);
        }

        Ok(Registration {
            endpoint: body.endpoint,
            hostname: body.hostname,
            uid: body.uid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_register_host() {
        let app = Router::new().route(
            "/endpoint",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["zone"], "eu-west-1a");
                assert_eq!(body["host"], "lb-3.example.net");
                Json(json!({
                    "endpoint": "proxy-3.example.net:7000",
                    "hostname": "a1.edge.example.net",
                    "uid": "u-17",
                }))
            }),
        );
        let base = serve(app).await;

        let registration = HttpDirectoryService::new()
            .register_host(&format!("{}/", base), Some("lb-3.example.net"), "eu-west-1a")
            .await
            .unwrap();

        assert_eq!(
            registration,
            Registration {
                endpoint: "proxy-3.example.net:7000".to_string(),
                hostname: "a1.edge.example.net".to_string(),
                uid: "u-17".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_register_empty_endpoint() {
        let app = Router::new().route(
            "/endpoint",
            post(|| async { Json(json!({ "hostname": "h", "uid": "u" })) }),
        );
        let base = serve(app).await;

        let result = HttpDirectoryService::new()
            .register_host(&base, None, "z")
            .await;
        assert!(matches!(result, Err(DirectoryError::EmptyEndpoint)));
    }

    #[tokio::test]
    async fn test_lookup_host() {
        let app = Router::new()
            .route("/lb", get(|| async { Json(json!({ "endpoint": "lb-1" })) }))
            .route("/empty", get(|| async { Json(json!({})) }))
            .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = serve(app).await;
        let directory = HttpDirectoryService::new();

        assert_eq!(
            directory.lookup_host(&format!("{}/lb", base)).await.unwrap(),
            Some("lb-1".to_string())
        );
        assert_eq!(directory.lookup_host(&format!("{}/empty", base)).await.unwrap(), None);
        assert!(matches!(
            directory.lookup_host(&format!("{}/down", base)).await,
            Err(DirectoryError::Status(503))
        ));
    }
}
