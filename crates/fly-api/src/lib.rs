//! Typed Rust client for the Fly.io Machines API.
//!
//! Covers the subset needed for project sandboxes: machines (create, get,
//! start, stop, delete, wait for a state) and volumes (create, get, delete).
//!
//! Nothing here retries on its own. Creating a machine twice is not
//! idempotent, so retry policy is left to callers.

mod types;

pub use types::*;

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

const BASE_URL: &str = "https://api.machines.dev/v1";

/// Longest response body kept in an [`Error::Api`].
const MAX_ERROR_BODY: usize = 512;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How far past its deadline a poll that is already in flight may run.
const POLL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly api {operation} {path} request failed: {source}")]
    Request {
        operation: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fly api {operation} {path} returned {status}: {message}")]
    Api {
        operation: &'static str,
        path: String,
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("machine {machine_id} did not reach {desired} within {waited:?} (last state: {last})")]
    Timeout {
        machine_id: String,
        desired: MachineState,
        last: MachineState,
        waited: Duration,
    },

    #[error("machine {machine_id} entered the error state while waiting for {desired}")]
    MachineFailed {
        machine_id: String,
        desired: MachineState,
    },
}

impl Error {
    /// HTTP status of an API error, if the server answered at all.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(reqwest::StatusCode::NOT_FOUND)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Fly.io Machines REST API.
#[derive(Clone)]
pub struct FlyClient {
    token: String,
    app: String,
    base_url: String,
    poll_interval: Duration,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            app: app.into(),
            base_url: BASE_URL.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at another API root (a proxy or a test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Interval between polls in [`FlyClient::wait_for_state`]. Clamped to 500ms.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Upper bound on any single request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    fn path(&self, suffix: &str) -> String {
        format!("/apps/{}{suffix}", self.app)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        operation: &'static str,
        path: &str,
    ) -> Result<reqwest::Response> {
        req.header("Authorization", self.auth())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| Error::Request {
                operation,
                path: path.to_string(),
                source,
            })
    }

    async fn check(
        resp: reqwest::Response,
        operation: &'static str,
        path: &str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                operation,
                path: path.to_string(),
                status,
                message: describe_error_body(&body),
            });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(
        resp: reqwest::Response,
        operation: &'static str,
        path: &str,
    ) -> Result<reqwest::Response> {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        Self::check(resp, operation, path).await
    }

    async fn json<T: DeserializeOwned>(
        resp: reqwest::Response,
        operation: &'static str,
        path: &str,
    ) -> Result<T> {
        Self::check(resp, operation, path)
            .await?
            .json()
            .await
            .map_err(|source| Error::Request {
                operation,
                path: path.to_string(),
                source,
            })
    }

    // ── Machines ─────────────────────────────────────────────────────

    pub async fn create_machine(&self, req: &CreateMachineRequest) -> Result<Machine> {
        let path = self.path("/machines");
        let resp = self
            .send(self.http.post(self.url(&path)).json(req), "create machine", &path)
            .await?;
        Self::json(resp, "create machine", &path).await
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Machine> {
        let path = self.path(&format!("/machines/{machine_id}"));
        let resp = self
            .send(self.http.get(self.url(&path)), "get machine", &path)
            .await?;
        Self::json(resp, "get machine", &path).await
    }

    pub async fn start_machine(&self, machine_id: &str) -> Result<()> {
        let path = self.path(&format!("/machines/{machine_id}/start"));
        let resp = self
            .send(self.http.post(self.url(&path)), "start machine", &path)
            .await?;
        Self::check(resp, "start machine", &path).await?;
        Ok(())
    }

    pub async fn stop_machine(&self, machine_id: &str) -> Result<()> {
        let path = self.path(&format!("/machines/{machine_id}/stop"));
        let resp = self
            .send(self.http.post(self.url(&path)), "stop machine", &path)
            .await?;
        Self::check(resp, "stop machine", &path).await?;
        Ok(())
    }

    /// Delete a machine. `force` also kills a machine that is still running.
    pub async fn delete_machine(&self, machine_id: &str, force: bool) -> Result<()> {
        let path = self.path(&format!("/machines/{machine_id}"));
        let mut req = self.http.delete(self.url(&path));
        if force {
            req = req.query(&[("force", "true")]);
        }
        let resp = self.send(req, "delete machine", &path).await?;
        Self::check_allow_404(resp, "delete machine", &path).await?;
        Ok(())
    }

    /// Poll a machine until it reports `desired`.
    ///
    /// Returns [`Error::MachineFailed`] as soon as the machine reports `error`
    /// and [`Error::Timeout`] once `timeout` has elapsed. A poll still in
    /// flight at the deadline is abandoned after a short grace period.
    pub async fn wait_for_state(
        &self,
        machine_id: &str,
        desired: MachineState,
        timeout: Duration,
    ) -> Result<Machine> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last = MachineState::Unknown;

        loop {
            let budget = deadline.saturating_duration_since(Instant::now()) + POLL_GRACE;
            let machine = match tokio::time::timeout(budget, self.get_machine(machine_id)).await {
                Ok(polled) => polled?,
                Err(_) => {
                    return Err(Error::Timeout {
                        machine_id: machine_id.to_string(),
                        desired,
                        last,
                        waited: started.elapsed(),
                    });
                }
            };
            if machine.state == desired {
                return Ok(machine);
            }
            if machine.state == MachineState::Error {
                return Err(Error::MachineFailed {
                    machine_id: machine_id.to_string(),
                    desired,
                });
            }
            last = machine.state;

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    machine_id: machine_id.to_string(),
                    desired,
                    last,
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    // ── Volumes ──────────────────────────────────────────────────────

    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Volume> {
        let path = self.path("/volumes");
        let resp = self
            .send(self.http.post(self.url(&path)).json(req), "create volume", &path)
            .await?;
        Self::json(resp, "create volume", &path).await
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        let path = self.path(&format!("/volumes/{volume_id}"));
        let resp = self
            .send(self.http.get(self.url(&path)), "get volume", &path)
            .await?;
        Self::json(resp, "get volume", &path).await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let path = self.path(&format!("/volumes/{volume_id}"));
        let resp = self
            .send(self.http.delete(self.url(&path)), "delete volume", &path)
            .await?;
        Self::check_allow_404(resp, "delete volume", &path).await?;
        Ok(())
    }
}

/// Render a non-2xx body: the `{error, message}` envelope when present,
/// otherwise the raw text cut to [`MAX_ERROR_BODY`] bytes.
fn describe_error_body(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        match (parsed.error, parsed.message) {
            (Some(error), Some(message)) => return format!("{error}: {message}"),
            (Some(text), None) | (None, Some(text)) => return text,
            (None, None) => {}
        }
    }
    truncate(body.trim(), MAX_ERROR_BODY)
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use serde_json::{Value, json};
    use tokio::sync::Mutex;

    async fn spawn_fake(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn machine_json(id: &str, state: &str) -> Value {
        json!({
            "id": id,
            "name": "project-1",
            "state": state,
            "region": "iad",
            "private_ip": "fdaa:0:1::2",
            "created_at": "2025-01-01T00:00:00Z",
        })
    }

    #[derive(Clone, Default)]
    struct Captured {
        body: Arc<Mutex<Option<Value>>>,
        auth: Arc<Mutex<Option<String>>>,
    }

    #[tokio::test]
    async fn create_machine_sends_token_and_guest_config() {
        let captured = Captured::default();
        let router = Router::new()
            .route(
                "/apps/{app}/machines",
                post(
                    |State(c): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| async move {
                        *c.auth.lock().await = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        *c.body.lock().await = Some(body);
                        Json(machine_json("m-1", "created"))
                    },
                ),
            )
            .with_state(captured.clone());
        let client = FlyClient::new("secret", "sandboxes").with_base_url(spawn_fake(router).await);

        let machine = client
            .create_machine(&CreateMachineRequest {
                name: "project-1".into(),
                region: "iad".into(),
                config: MachineConfig {
                    image: "sandbox-vm:latest".into(),
                    env: None,
                    guest: GuestConfig {
                        cpu_kind: "shared".into(),
                        cpus: 2,
                        memory_mb: 1024,
                        gpu_kind: None,
                    },
                    mounts: Some(vec![MachineMount {
                        volume: "vol_1".into(),
                        path: "/workspace".into(),
                    }]),
                    auto_destroy: Some(false),
                    restart: None,
                },
            })
            .await
            .unwrap();

        assert_eq!(machine.id, "m-1");
        assert_eq!(machine.state, MachineState::Created);
        assert_eq!(machine.private_ip.as_deref(), Some("fdaa:0:1::2"));
        assert_eq!(captured.auth.lock().await.as_deref(), Some("Bearer secret"));

        let body = captured.body.lock().await.clone().unwrap();
        assert_eq!(body["config"]["guest"]["cpu_kind"], "shared");
        assert_eq!(body["config"]["mounts"][0]["volume"], "vol_1");
        assert!(body["config"]["guest"].get("gpu_kind").is_none());
        assert!(body["config"].get("env").is_none());
    }

    #[tokio::test]
    async fn api_error_envelope_is_surfaced_with_context() {
        let router = Router::new().route(
            "/apps/{app}/machines/{id}/start",
            post(|| async {
                (
                    StatusCode::PRECONDITION_FAILED,
                    Json(json!({"error": "failed_precondition", "message": "machine is destroyed"})),
                )
            }),
        );
        let client = FlyClient::new("t", "sandboxes").with_base_url(spawn_fake(router).await);

        let err = client.start_machine("m-9").await.unwrap_err();
        match &err {
            Error::Api {
                operation,
                path,
                status,
                message,
            } => {
                assert_eq!(*operation, "start machine");
                assert_eq!(path, "/apps/sandboxes/machines/m-9/start");
                assert_eq!(*status, StatusCode::PRECONDITION_FAILED);
                assert_eq!(message, "failed_precondition: machine is destroyed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn raw_error_bodies_are_truncated() {
        let router = Router::new().route(
            "/apps/{app}/machines/{id}",
            get(|| async { (StatusCode::BAD_GATEWAY, "x".repeat(4096)).into_response() }),
        );
        let client = FlyClient::new("t", "sandboxes").with_base_url(spawn_fake(router).await);

        let err = client.get_machine("m-1").await.unwrap_err();
        let Error::Api { message, .. } = err else {
            panic!("expected api error");
        };
        assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY)));
        assert!(message.ends_with("(4096 bytes total)"));
        assert!(message.len() < 600);
    }

    #[tokio::test]
    async fn delete_volume_treats_missing_volume_as_deleted() {
        let router = Router::new().route(
            "/apps/{app}/volumes/{id}",
            delete(|| async { StatusCode::NOT_FOUND }),
        );
        let client = FlyClient::new("t", "sandboxes").with_base_url(spawn_fake(router).await);

        client.delete_volume("vol_gone").await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_state_returns_once_state_matches() {
        let polls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/apps/{app}/machines/{id}",
                get(
                    |State(polls): State<Arc<AtomicUsize>>, Path((_app, id)): Path<(String, String)>| async move {
                        let n = polls.fetch_add(1, Ordering::SeqCst);
                        let state = if n < 2 { "starting" } else { "started" };
                        Json(machine_json(&id, state))
                    },
                ),
            )
            .with_state(polls.clone());
        let client = FlyClient::new("t", "sandboxes")
            .with_base_url(spawn_fake(router).await)
            .with_poll_interval(Duration::from_millis(500));

        let machine = client
            .wait_for_state("m-1", MachineState::Started, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(machine.state, MachineState::Started);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_state_times_out_with_timeout_error() {
        let router = Router::new().route(
            "/apps/{app}/machines/{id}",
            get(|Path((_app, id)): Path<(String, String)>| async move {
                Json(machine_json(&id, "starting"))
            }),
        );
        let client = FlyClient::new("t", "sandboxes")
            .with_base_url(spawn_fake(router).await)
            .with_poll_interval(Duration::from_millis(500));

        let timeout = Duration::from_millis(1200);
        let started = std::time::Instant::now();
        let err = client
            .wait_for_state("m-1", MachineState::Started, timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
        match err {
            Error::Timeout { last, desired, .. } => {
                assert_eq!(last, MachineState::Starting);
                assert_eq!(desired, MachineState::Started);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_state_gives_up_on_a_hung_request() {
        let router = Router::new().route(
            "/apps/{app}/machines/{id}",
            get(|Path((_app, id)): Path<(String, String)>| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(machine_json(&id, "started"))
            }),
        );
        let client = FlyClient::new("t", "sandboxes").with_base_url(spawn_fake(router).await);

        let timeout = Duration::from_secs(1);
        let started = std::time::Instant::now();
        let err = client
            .wait_for_state("m-1", MachineState::Started, timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert!(started.elapsed() < timeout + POLL_GRACE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn requests_are_bounded_by_the_request_timeout() {
        let router = Router::new().route(
            "/apps/{app}/volumes/{id}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        );
        let client = FlyClient::new("t", "sandboxes")
            .with_base_url(spawn_fake(router).await)
            .with_request_timeout(Duration::from_millis(200));

        match client.get_volume("vol_1").await.unwrap_err() {
            Error::Request { source, .. } => assert!(source.is_timeout()),
            other => panic!("expected request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_state_stops_on_error_state() {
        let polls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/apps/{app}/machines/{id}",
                get(
                    |State(polls): State<Arc<AtomicUsize>>, Path((_app, id)): Path<(String, String)>| async move {
                        polls.fetch_add(1, Ordering::SeqCst);
                        Json(machine_json(&id, "error"))
                    },
                ),
            )
            .with_state(polls.clone());
        let client = FlyClient::new("t", "sandboxes").with_base_url(spawn_fake(router).await);

        let err = client
            .wait_for_state("m-1", MachineState::Started, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MachineFailed { .. }));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_states_deserialize() {
        let machine: Machine =
            serde_json::from_value(machine_json("m-1", "launching")).unwrap();
        assert_eq!(machine.state, MachineState::Unknown);
    }

    #[test]
    fn poll_interval_is_clamped() {
        let client = FlyClient::new("t", "a").with_poll_interval(Duration::from_millis(10));
        assert_eq!(client.poll_interval, MIN_POLL_INTERVAL);
    }
}
