use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_config::Config;
use warden_contracts::{
    DemoLoginResponse, DemoStatusResponse, ErrorResponse, SimulatedResponse, TokenKind,
    VerifyRequest, VerifyResponse, DEMO_USERNAME,
};
use warden_kernel::{
    demo_permissions, evaluate_demo_policy, is_demo_user, next_reset_after, session_expiry,
    simulated_actions, DemoPolicy, InterceptDecision,
};

const MAX_PROXY_BODY_BYTES: usize = 64 * 1024 * 1024;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg).await?;
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))?;

    state.reset.shutdown().await;
    Ok(())
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(router(state))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/demo/login", post(demo_login))
        .route("/api/demo/status", get(demo_status))
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(state.clone(), demo_gate))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    sessions: Arc<SessionStore>,
    reset: Arc<ResetCoordinator>,
    auth: Arc<AuthService>,
    upstream: UpstreamClient,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let auth = Arc::new(AuthService::new(&cfg)?);
        let sessions = Arc::new(SessionStore::new());
        let reset = Arc::new(ResetCoordinator::new(cfg.demo.reset_interval_hours));
        let upstream = UpstreamClient::new(&cfg)?;

        // idle -> armed happens exactly once, and only when demo mode is on.
        if cfg.demo.enabled {
            reset.initialize(Utc::now()).await;
            Arc::clone(&reset).arm(Arc::clone(&sessions)).await;
        }

        Ok(Self {
            cfg: Arc::new(cfg),
            sessions,
            reset,
            auth,
            upstream,
        })
    }
}

/// Identity marker attached to the request once a demo caller is recognized.
/// Downstream stages (the proxy forward) read it to add the marker headers.
#[derive(Debug, Clone)]
pub struct DemoCaller(pub String);

/// Runs before every route. Resolves the caller, consults the demo policy
/// and either answers with the simulated envelope or hands the request to
/// the next stage unchanged. Every branch resolves to a response; this
/// function has no error path.
async fn demo_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if !state.cfg.demo.enabled {
        return next.run(req).await;
    }

    let caller = match req.extensions().get::<DemoCaller>() {
        Some(attached) => Some(attached.0.clone()),
        None => match bearer_token(req.headers()) {
            Some(token) => state.auth.verify(token, TokenKind::Access, Utc::now()).await,
            None => None,
        },
    };
    let Some(caller) = caller else {
        return next.run(req).await;
    };
    if !is_demo_user(&caller) {
        return next.run(req).await;
    }
    req.extensions_mut().insert(DemoCaller(caller.clone()));

    let rule = warden_kernel::resolve(req.uri().path(), req.method().as_str());
    let policy = DemoPolicy { enabled: true };
    match evaluate_demo_policy(&policy, Some(&caller), rule) {
        InterceptDecision::Simulate { action } => {
            debug!(action, path = %req.uri().path(), "intercepted demo mutation");
            Json(SimulatedResponse::new(state.cfg.demo.simulated_message.clone())).into_response()
        }
        InterceptDecision::PassThrough => next.run(req).await,
    }
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn demo_login(State(state): State<AppState>) -> Response {
    if !state.cfg.demo.enabled {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("demo.disabled", "demo mode is disabled")),
        )
            .into_response();
    }

    let now = Utc::now();
    let (token, expires_at) = state.auth.issue_demo_token(now).await;
    let session = state.sessions.create(now).await;
    info!(session_id = %session.session_id, "demo session created");

    Json(DemoLoginResponse {
        token,
        username: DEMO_USERNAME.to_string(),
        permissions: demo_permissions().iter().map(|s| s.to_string()).collect(),
        is_demo: true,
        expires_at: expires_at.to_rfc3339(),
    })
    .into_response()
}

async fn demo_status(State(state): State<AppState>) -> Json<DemoStatusResponse> {
    let now = Utc::now();
    let reset = state.reset.snapshot().await;
    Json(DemoStatusResponse {
        enabled: state.cfg.demo.enabled,
        active_sessions: state.sessions.count_active(now).await,
        last_reset: reset.map(|r| r.last_reset.to_rfc3339()),
        next_reset: reset.map(|r| r.next_reset.to_rfc3339()),
        reset_interval_hours: state.cfg.demo.reset_interval_hours,
        simulated_actions: simulated_actions().iter().map(|s| s.to_string()).collect(),
    })
}

/// Fallback for every route warden does not own: forward to the upstream
/// panel. Inbound marker headers are stripped so clients cannot spoof the
/// demo flag; for recognized demo callers the markers are re-added from the
/// request extension.
async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let demo = req.extensions().get::<DemoCaller>().cloned();

    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    // hop-by-hop headers describe the inbound connection, not the buffered
    // request we re-issue upstream
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove("x-warden-demo");
    headers.remove("x-warden-user");
    if let Some(DemoCaller(user)) = &demo {
        headers.insert("x-warden-demo", HeaderValue::from_static("true"));
        if let Ok(value) = HeaderValue::from_str(user) {
            headers.insert("x-warden-user", value);
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "request.invalid",
                &format!("request body read failed: {e}"),
            );
        }
    };

    let url = format!("{}{}", state.upstream.base_url, path_and_query);
    let sent = state
        .upstream
        .client
        .request(method, url.as_str())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream_response = match sent {
        Ok(response) => response,
        Err(e) => {
            warn!(%url, error = %e, "upstream request failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream.unreachable",
                "upstream panel did not answer",
            );
        }
    };

    let status = upstream_response.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%url, error = %e, "upstream body read failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream.unreachable",
                "upstream panel did not answer",
            );
        }
    };
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ErrorResponse::new(code, message))).into_response()
}

/// Extract the bearer credential, if any. Missing or malformed headers are a
/// valid outcome, never a fault.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct DemoSession {
    pub session_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Ephemeral demo sessions, used for informational counts only.
/// Authorization never flows through session lookup, so eviction stays lazy.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, DemoSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, now: DateTime<Utc>) -> DemoSession {
        let session = DemoSession {
            session_id: format!("sess_{}", uuid::Uuid::new_v4().as_simple()),
            username: DEMO_USERNAME.to_string(),
            created_at: now,
            expires_at: session_expiry(now),
        };
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    pub async fn count_active(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, s| now < s.expires_at);
        sessions.len()
    }

    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let cleared = sessions.len();
        sessions.clear();
        cleared
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResetState {
    pub last_reset: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
}

/// Periodic demo reset. `initialize` records the first reset window, `arm`
/// spawns the repeating task exactly once, and the handle stays abortable so
/// shutdown and test teardown can cancel it deterministically.
pub struct ResetCoordinator {
    interval_hours: i64,
    state: Mutex<Option<ResetState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResetCoordinator {
    pub fn new(interval_hours: i64) -> Self {
        Self {
            interval_hours,
            state: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub async fn initialize(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(ResetState {
                last_reset: now,
                next_reset: next_reset_after(now, self.interval_hours),
            });
        }
    }

    pub async fn arm(self: Arc<Self>, sessions: Arc<SessionStore>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let coordinator = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            let period =
                Duration::from_secs(coordinator.interval_hours.unsigned_abs().saturating_mul(3600));
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately; consume it so the first real
            // reset happens one full interval after arming
            ticker.tick().await;
            loop {
                ticker.tick().await;
                coordinator.perform_reset(&sessions, Utc::now()).await;
            }
        }));
    }

    pub async fn perform_reset(&self, sessions: &SessionStore, now: DateTime<Utc>) {
        let cleared = sessions.clear().await;
        let mut state = self.state.lock().await;
        *state = Some(ResetState {
            last_reset: now,
            next_reset: next_reset_after(now, self.interval_hours),
        });
        info!(cleared, "demo reset performed");
    }

    pub async fn snapshot(&self) -> Option<ResetState> {
        *self.state.lock().await
    }

    pub async fn is_armed(&self) -> bool {
        self.task.lock().await.is_some()
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

struct IssuedToken {
    username: String,
    kind: TokenKind,
    expires_at: DateTime<Utc>,
}

/// Token verifier and demo login issuer. Demo tokens are minted and checked
/// locally, stored by SHA-256 digest. Non-demo tokens go to the configured
/// static table (builtin mode) or to the remote verify endpoint; every
/// failure on that path resolves to "no identity" rather than an error.
pub struct AuthService {
    mode: String,
    verify_endpoint: Option<String>,
    static_tokens: BTreeMap<String, String>,
    issued: Mutex<HashMap<String, IssuedToken>>,
    client: Client,
}

impl AuthService {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.auth.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            mode: cfg.auth.mode.clone(),
            verify_endpoint: cfg.auth.verify_endpoint.clone(),
            static_tokens: cfg.auth.static_tokens.clone(),
            issued: Mutex::new(HashMap::new()),
            client,
        })
    }

    pub async fn issue_demo_token(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let token = format!("demo_{}", uuid::Uuid::new_v4().as_simple());
        let expires_at = session_expiry(now);
        let mut issued = self.issued.lock().await;
        issued.retain(|_, t| now < t.expires_at);
        issued.insert(
            sha256_hex(token.as_bytes()),
            IssuedToken {
                username: DEMO_USERNAME.to_string(),
                kind: TokenKind::Access,
                expires_at,
            },
        );
        (token, expires_at)
    }

    pub async fn verify(
        &self,
        token: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Option<String> {
        {
            let issued = self.issued.lock().await;
            if let Some(entry) = issued.get(&sha256_hex(token.as_bytes())) {
                if entry.kind == kind && now < entry.expires_at {
                    return Some(entry.username.clone());
                }
                return None;
            }
        }
        match self.mode.as_str() {
            "remote" => self.verify_remote(token, kind).await,
            _ => self.verify_builtin(token, kind),
        }
    }

    fn verify_builtin(&self, token: &str, kind: TokenKind) -> Option<String> {
        if kind != TokenKind::Access {
            return None;
        }
        self.static_tokens
            .iter()
            .find(|(_, configured)| ct_eq(configured.as_bytes(), token.as_bytes()))
            .map(|(username, _)| username.clone())
    }

    async fn verify_remote(&self, token: &str, kind: TokenKind) -> Option<String> {
        let endpoint = self.verify_endpoint.as_deref()?;
        let request = VerifyRequest {
            token: token.to_string(),
            kind,
        };
        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: VerifyResponse = response.json().await.ok()?;
        body.username
    }
}

#[derive(Clone)]
struct UpstreamClient {
    base_url: String,
    client: Client,
}

impl UpstreamClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.upstream.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            base_url: cfg.upstream.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
