//! HTTP client for the render worker contract.
//!
//! Endpoints, all loopback plaintext:
//! - `GET /health`: liveness, any 2xx counts
//! - `POST /config/api-key`: `{"api_key": "<string>"}`
//! - `GET /characters`: JSON array of character records
//! - `POST /render`: serialized script in, video location out
//!
//! Worker responses are decoded leniently: field names match
//! case-insensitively, and a render location may arrive as a JSON object, a
//! bare JSON string, or plain text.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::script::{Character, RenderJob};
use crate::supervisor::SupervisorError;

/// API key for the render worker. Held only in memory; the `Debug` form is
/// redacted so the value cannot leak through logs or error chains.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for transmission to the worker only.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(redacted)")
    }
}

impl From<&str> for ApiKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[derive(Serialize)]
struct ConfigureRequest<'a> {
    api_key: &'a str,
}

/// Client bound to one worker instance's port.
///
/// Cheap to clone; all clones share the supervisor's connection pool. Health
/// probes carry their own short timeout so a stalled worker cannot eat the
/// whole readiness budget in one attempt.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base: Url,
    port: u16,
    probe_timeout: Duration,
}

impl WorkerClient {
    pub fn new(http: reqwest::Client, port: u16, probe_timeout: Duration) -> Self {
        let base = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .expect("loopback base URL is always valid");
        Self {
            http,
            base,
            port,
            probe_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    /// Probe `/health`. Any network failure is a `false`, never an error.
    pub async fn health(&self) -> bool {
        let request = self
            .http
            .get(self.endpoint("health"))
            .timeout(self.probe_timeout);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Send the API key to the worker.
    pub async fn configure(&self, key: &ApiKey) -> Result<(), SupervisorError> {
        let response = self
            .http
            .post(self.endpoint("config/api-key"))
            .json(&ConfigureRequest {
                api_key: key.reveal(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SupervisorError::ConfigurationRejected {
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Fetch the worker's character roster.
    pub async fn characters(&self) -> Result<Vec<Character>, SupervisorError> {
        let response = self
            .http
            .get(self.endpoint("characters"))
            .send()
            .await?
            .error_for_status()?;

        let records: Vec<Value> = response.json().await?;
        records.iter().map(decode_character).collect()
    }

    /// Submit a render job and resolve the returned location against the
    /// worker's base URL.
    pub async fn render(&self, job: &RenderJob) -> Result<Url, SupervisorError> {
        let response = self
            .http
            .post(self.endpoint("render"))
            .json(job)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let location = extract_location(&body).ok_or_else(|| {
            SupervisorError::UnexpectedResponse(
                "render response carries no video location".to_string(),
            )
        })?;
        self.resolve(&location)
    }

    fn resolve(&self, location: &str) -> Result<Url, SupervisorError> {
        if let Ok(absolute) = Url::parse(location) {
            return Ok(absolute);
        }
        self.base.join(location).map_err(|e| {
            SupervisorError::UnexpectedResponse(format!(
                "render location {location:?} is not a valid URL: {e}"
            ))
        })
    }
}

/// Case-insensitive field lookup; worker records vary between `Id`/`id`/`ID`
/// style casing.
fn field<'a>(map: &'a serde_json::Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn decode_character(record: &Value) -> Result<Character, SupervisorError> {
    let map = record.as_object().ok_or_else(|| {
        SupervisorError::UnexpectedResponse(format!(
            "character record is not an object: {record}"
        ))
    })?;

    let id = field(map, "id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            SupervisorError::UnexpectedResponse("character record has no usable id".to_string())
        })?;
    let name = field(map, "name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            SupervisorError::UnexpectedResponse(format!("character {id} has no name"))
        })?
        .to_string();

    Ok(Character {
        id,
        name,
        default_voice_id: field(map, "defaultVoiceId")
            .and_then(Value::as_str)
            .map(String::from),
        image_base_path: field(map, "imageBasePath")
            .and_then(Value::as_str)
            .map(PathBuf::from),
    })
}

/// Pull a location out of a render response body: a JSON object keyed
/// `video_url`/`url`/`location` (any case), a bare JSON string, or plain
/// text.
fn extract_location(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return match value {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            Value::Object(map) => ["video_url", "url", "location"]
                .iter()
                .find_map(|key| field(&map, key).and_then(Value::as_str))
                .filter(|s| !s.trim().is_empty())
                .map(String::from),
            _ => None,
        };
    }

    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(port: u16) -> WorkerClient {
        WorkerClient::new(reqwest::Client::new(), port, Duration::from_millis(250))
    }

    async fn refused_port() -> u16 {
        // Bind then immediately free a port so nothing is listening on it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::from("sk-super-secret");
        let debug = format!("{key:?}");
        assert!(!debug.contains("secret"));
        assert_eq!(debug, "ApiKey(redacted)");
    }

    #[tokio::test]
    async fn health_true_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(test_client(server.address().port()).health().await);
    }

    #[tokio::test]
    async fn health_false_on_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(!test_client(server.address().port()).health().await);
    }

    #[tokio::test]
    async fn health_false_when_connection_refused() {
        assert!(!test_client(refused_port().await).health().await);
    }

    #[tokio::test]
    async fn configure_posts_the_key_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/config/api-key"))
            .and(body_json(serde_json::json!({"api_key": "sk-test-1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.address().port());
        client.configure(&ApiKey::from("sk-test-1")).await.unwrap();
    }

    #[tokio::test]
    async fn configure_surfaces_rejection_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/config/api-key"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let err = test_client(server.address().port())
            .configure(&ApiKey::from("bad"))
            .await
            .unwrap_err();
        match err {
            SupervisorError::ConfigurationRejected { status } => assert_eq!(status.as_u16(), 400),
            other => panic!("expected ConfigurationRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn configure_propagates_network_errors() {
        let err = test_client(refused_port().await)
            .configure(&ApiKey::from("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Request(_)));
    }

    #[tokio::test]
    async fn characters_decode_ignores_field_case() {
        let reimu = Uuid::new_v4();
        let marisa = Uuid::new_v4();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/characters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Id": reimu.to_string(), "Name": "Reimu", "DefaultVoiceId": "reimu"},
                {"id": marisa.to_string(), "name": "Marisa", "imageBasePath": "assets/marisa"}
            ])))
            .mount(&server)
            .await;

        let cast = test_client(server.address().port())
            .characters()
            .await
            .unwrap();

        assert_eq!(cast.len(), 2);
        assert_eq!(cast[0].id, reimu);
        assert_eq!(cast[0].name, "Reimu");
        assert_eq!(cast[0].default_voice_id.as_deref(), Some("reimu"));
        assert_eq!(cast[1].id, marisa);
        assert_eq!(
            cast[1].image_base_path.as_deref(),
            Some(std::path::Path::new("assets/marisa"))
        );
    }

    #[tokio::test]
    async fn characters_reject_record_without_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/characters"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"name": "Nameless"}])),
            )
            .mount(&server)
            .await;

        let err = test_client(server.address().port())
            .characters()
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn render_joins_relative_location_with_base() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"video_url": "/videos/out.mp4"})),
            )
            .mount(&server)
            .await;

        let port = server.address().port();
        let url = test_client(port)
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap();
        assert_eq!(url.as_str(), format!("http://127.0.0.1:{port}/videos/out.mp4"));
    }

    #[tokio::test]
    async fn render_accepts_plain_text_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(200).set_body_string("/videos/out.mp4"))
            .mount(&server)
            .await;

        let port = server.address().port();
        let url = test_client(port)
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap();
        assert_eq!(url.path(), "/videos/out.mp4");
        assert_eq!(url.port_or_known_default(), Some(port));
    }

    #[tokio::test]
    async fn render_accepts_bare_json_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!("/videos/out.mp4")),
            )
            .mount(&server)
            .await;

        let url = test_client(server.address().port())
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap();
        assert_eq!(url.path(), "/videos/out.mp4");
    }

    #[tokio::test]
    async fn render_passes_absolute_location_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"url": "http://127.0.0.1:9999/videos/elsewhere.mp4"}),
            ))
            .mount(&server)
            .await;

        let url = test_client(server.address().port())
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9999/videos/elsewhere.mp4");
    }

    #[tokio::test]
    async fn render_rejects_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let err = test_client(server.address().port())
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn render_propagates_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = test_client(server.address().port())
            .render(&RenderJob::from_script(&crate::Script::default()))
            .await
            .unwrap_err();
        match err {
            SupervisorError::Request(e) => assert!(e.is_status()),
            other => panic!("expected Request, got {other:?}"),
        }
    }
}
