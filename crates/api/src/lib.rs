//! Rancher API client utilities.
//!
//! A thin client for the two API surfaces the provisioning flow touches:
//!
//! - the `v1` schema endpoint used as a readiness probe while the
//!   `rancher/server` container boots
//! - the `v2-beta` API for the `api.host` setting, projects, registration
//!   tokens and hosts
//!
//! Every call reports failures as an [`AttemptError`] whose
//! [`FailureKind`](corral_types::FailureKind) is decided here, once, from
//! the transport error or status code: connection errors and 5xx are
//! transient, 404 is not-found, any other 4xx is fatal.
//!
//! # Example
//!
//! ```ignore
//! use corral_api::RancherClient;
//!
//! let client = RancherClient::for_server("10.0.0.5", 8080, None)?;
//! let ready = client.probe_schema("amazonec2Config").await?;
//! ```

use std::time::Duration;

use corral_types::{AttemptError, FailureKind, Observation};
use corral_util::http::{classify_status, classify_transport, status_error_message, truncate_response_preview};
use reqwest::{Client, Method, header};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub mod model;

pub use model::{Collection, Host, Project, RegistrationToken};

/// Schema that only appears once the server has fully started.
pub const READINESS_SCHEMA: &str = "amazonec2Config";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PREVIEW_LIMIT: usize = 200;

/// Error building a client; request failures use [`AttemptError`].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid Rancher URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// API key pair for an access-controlled server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Thin wrapper around a configured `reqwest::Client` for one Rancher server.
#[derive(Debug, Clone)]
pub struct RancherClient {
    pub base_url: String,
    pub http: Client,
    pub user_agent: String,
    credentials: Option<ApiCredentials>,
}

impl RancherClient {
    /// Build a client for an explicit base URL such as `http://10.0.0.5:8080`.
    pub fn new(base_url: &str, credentials: Option<ApiCredentials>) -> Result<Self, ApiError> {
        let base_url = validate_base_url(base_url)?;

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("corral/{}; {}", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
            credentials,
        })
    }

    /// Build a client for a server node's address and published port.
    pub fn for_server(address: &str, port: u16, credentials: Option<ApiCredentials>) -> Result<Self, ApiError> {
        Self::new(&format!("http://{}:{}", address.trim(), port), credentials)
    }

    /// `GET /v1/schemas/{schema}`: `Flag(true)` once it answers 200.
    ///
    /// A 404 means the server is up but has not registered the schema yet,
    /// which is reported as `Flag(false)` rather than an error.
    pub async fn probe_schema(&self, schema: &str) -> Result<Observation, AttemptError> {
        match self.send(Method::GET, &format!("/v1/schemas/{schema}"), None).await {
            Ok(_) => Ok(Observation::Flag(true)),
            Err(error) if error.kind == FailureKind::NotFound => Ok(Observation::Flag(false)),
            Err(error) => Err(error),
        }
    }

    /// `PUT /v2-beta/settings/api.host`.
    pub async fn set_api_host(&self, value: &str) -> Result<(), AttemptError> {
        let body = json!({ "id": "api.host", "name": "api.host", "value": value });
        self.send(Method::PUT, "/v2-beta/settings/api.host", Some(body)).await?;
        Ok(())
    }

    /// Current `api.host` value, if set.
    pub async fn api_host(&self) -> Result<Option<String>, AttemptError> {
        let value = self.send(Method::GET, "/v2-beta/settings/api.host", None).await?;
        Ok(value
            .get("value")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }

    pub async fn projects(&self) -> Result<Vec<Project>, AttemptError> {
        let value = self.send(Method::GET, "/v2-beta/projects", None).await?;
        decode::<Collection<Project>>(value).map(|collection| collection.data)
    }

    /// Id of the first project, the one agents register with by default.
    pub async fn default_project_id(&self) -> Result<String, AttemptError> {
        self.projects()
            .await?
            .into_iter()
            .next()
            .map(|project| project.id)
            .ok_or_else(|| AttemptError::transient("server has no projects yet"))
    }

    /// `POST /v2-beta/projects/{project}/registrationtokens`.
    pub async fn create_registration_token(&self, project_id: &str) -> Result<(), AttemptError> {
        let path = format!("/v2-beta/projects/{project_id}/registrationtokens");
        self.send(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    /// Registration command of the first active token, once one exists.
    pub async fn registration_command(&self, project_id: &str) -> Result<Option<String>, AttemptError> {
        let path = format!("/v2-beta/projects/{project_id}/registrationtokens?state=active");
        let value = self.send(Method::GET, &path, None).await?;
        let tokens = decode::<Collection<RegistrationToken>>(value)?;
        Ok(tokens.data.into_iter().find_map(|token| token.usable_command()))
    }

    pub async fn hosts(&self, project_id: &str) -> Result<Vec<Host>, AttemptError> {
        let value = self.send(Method::GET, &format!("/v2-beta/projects/{project_id}/hosts"), None).await?;
        decode::<Collection<Host>>(value).map(|collection| collection.data)
    }

    /// Live count of hosts reporting `active`.
    pub async fn active_host_count(&self, project_id: &str) -> Result<Observation, AttemptError> {
        let hosts = self.hosts(project_id).await?;
        Ok(Observation::Count(hosts.iter().filter(|host| host.is_active()).count() as u64))
    }

    pub async fn deactivate_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError> {
        let path = format!("/v2-beta/projects/{project_id}/hosts/{host_id}?action=deactivate");
        self.send(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    pub async fn delete_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError> {
        let path = format!("/v2-beta/projects/{project_id}/hosts/{host_id}");
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, AttemptError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "sending request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(header::USER_AGENT, &self.user_agent);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.access_key, Some(&credentials.secret_key));
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| AttemptError::new(classify_transport(&error), format!("{method} {url}: {error}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| AttemptError::transient(format!("{method} {url}: reading body failed: {error}")))?;

        if let Some(kind) = classify_status(status) {
            let hint = status_error_message(status.as_u16())
                .map(|hint| format!(" [{hint}]"))
                .unwrap_or_default();
            return Err(AttemptError::new(
                kind,
                format!(
                    "{method} {url} returned {status}{hint}: {}",
                    truncate_response_preview(&text, PREVIEW_LIMIT)
                ),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|error| {
            AttemptError::fatal(format!(
                "{method} {url} returned malformed JSON ({error}): {}",
                truncate_response_preview(&text, PREVIEW_LIMIT)
            ))
        })
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, AttemptError> {
    serde_json::from_value(value).map_err(|error| AttemptError::fatal(format!("unexpected response shape: {error}")))
}

/// Validate and normalize a base URL: http(s), a host, no path or query.
fn validate_base_url(base: &str) -> Result<String, ApiError> {
    let invalid = |reason: &str| ApiError::InvalidBaseUrl {
        url: base.to_string(),
        reason: reason.to_string(),
    };
    let parsed = Url::parse(base.trim()).map_err(|error| invalid(&error.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("a host is required"));
    }
    if parsed.path() != "/" || parsed.query().is_some() {
        return Err(invalid("the base URL must not carry a path or query"));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;

    /// Serve one canned HTTP response per accepted connection.
    fn serve(responses: Vec<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buffer = [0u8; 4096];
                let _ = stream.read(&mut buffer);
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        port
    }

    fn response(status: &str, body: &str) -> &'static str {
        Box::leak(
            format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        )
    }

    #[test]
    fn base_url_validation() {
        assert_eq!(validate_base_url("http://10.0.0.5:8080/").unwrap(), "http://10.0.0.5:8080");
        assert!(validate_base_url("ftp://10.0.0.5").is_err());
        assert!(validate_base_url("http://10.0.0.5:8080/v1/schemas").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RancherClient::for_server("127.0.0.1", port, None).unwrap();
        let error = client.probe_schema(READINESS_SCHEMA).await.unwrap_err();
        assert_eq!(error.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn forbidden_is_fatal_with_hint() {
        let port = serve(vec![response("403 Forbidden", "{\"message\":\"denied\"}")]);
        let client = RancherClient::for_server("127.0.0.1", port, None).unwrap();
        let error = client.probe_schema(READINESS_SCHEMA).await.unwrap_err();
        assert_eq!(error.kind, FailureKind::Fatal);
        assert!(error.message.contains("Forbidden (403)"));
    }

    #[tokio::test]
    async fn missing_schema_is_not_ready_yet() {
        let port = serve(vec![response("404 Not Found", "{}")]);
        let client = RancherClient::for_server("127.0.0.1", port, None).unwrap();
        let observation = client.probe_schema(READINESS_SCHEMA).await.unwrap();
        assert_eq!(observation, Observation::Flag(false));
    }

    #[tokio::test]
    async fn counts_only_active_hosts() {
        let body = r#"{"type":"collection","data":[
            {"id":"1h1","state":"active","hostname":"agent0"},
            {"id":"1h2","state":"registering","hostname":"agent1"},
            {"id":"1h3","state":"active","hostname":"agent2"}]}"#;
        let port = serve(vec![response("200 OK", body)]);
        let client = RancherClient::for_server("127.0.0.1", port, None).unwrap();
        let count = client.active_host_count("1a5").await.unwrap();
        assert_eq!(count, Observation::Count(2));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let port = serve(vec![response("503 Service Unavailable", "")]);
        let client = RancherClient::for_server("127.0.0.1", port, None).unwrap();
        let error = client.projects().await.unwrap_err();
        assert_eq!(error.kind, FailureKind::Transient);
    }
}
