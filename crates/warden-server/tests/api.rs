use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, Request as HttpRequest, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt;
use warden_config::{Auth, Config, Demo, Server, Upstream};
use warden_contracts::DEMO_USERNAME;
use warden_server::build_app;

fn test_config(upstream_base: &str, demo_enabled: bool) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        upstream: Upstream {
            base_url: upstream_base.to_string(),
            timeout_ms: 2000,
        },
        demo: Demo {
            enabled: demo_enabled,
            reset_interval_hours: 6,
            simulated_message: "simulated by warden".to_string(),
        },
        auth: Auth {
            mode: "builtin".to_string(),
            verify_endpoint: None,
            timeout_ms: 1000,
            static_tokens: [("admin".to_string(), "admin-token".to_string())]
                .into_iter()
                .collect(),
        },
    }
}

/// Stand-in for the real panel backend: counts non-GET requests as mutations
/// and echoes the warden marker headers back in the body.
async fn spawn_upstream_spy() -> (String, Arc<AtomicUsize>) {
    let mutations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&mutations);
    let app = axum::Router::new().fallback(move |req: Request| {
        let counter = Arc::clone(&counter);
        async move {
            if req.method() != Method::GET {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            Json(json!({
                "ok": true,
                "demo": header("x-warden-demo"),
                "user": header("x-warden-user"),
                "connection": header("connection"),
                "transfer_encoding": header("transfer-encoding"),
            }))
            .into_response()
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind spy");
    let addr = listener.local_addr().expect("spy addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), mutations)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn login(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(
            HttpRequest::builder()
                .method("POST")
                .uri("/api/demo/login")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["token"].as_str().expect("token").to_string()
}

fn request(method: &str, uri: &str, bearer: Option<&str>) -> HttpRequest<Body> {
    let mut builder = HttpRequest::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn simulated_mutation_returns_envelope_and_never_reaches_upstream() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body,
        json!({
            "success": true,
            "message": "simulated by warden",
            "simulated": true
        })
    );
    assert_eq!(mutations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn demo_reads_pass_through_with_marker_headers() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/api/players", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["demo"], json!("true"));
    assert_eq!(body["user"], json!(DEMO_USERNAME));
    assert_eq!(mutations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn marker_headers_cannot_be_spoofed_by_clients() {
    let (upstream, _mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let req = HttpRequest::builder()
        .method("GET")
        .uri("/api/players")
        .header("x-warden-demo", "true")
        .header("x-warden-user", "demo")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["demo"], json!(null));
    assert_eq!(body["user"], json!(null));
}

#[tokio::test]
async fn hop_by_hop_headers_are_not_forwarded_upstream() {
    let (upstream, _mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let req = HttpRequest::builder()
        .method("GET")
        .uri("/api/players")
        .header("connection", "close")
        .header("transfer-encoding", "chunked")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["connection"], json!(null));
    assert_eq!(body["transfer_encoding"], json!(null));
}

#[tokio::test]
async fn admin_mutations_reach_the_upstream_unmarked() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", Some("admin-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["demo"], json!(null));
    assert_eq!(mutations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn anonymous_requests_pass_through_untouched() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(mutations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmapped_routes_pass_through_for_demo_callers() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/api/motd", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(mutations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_demo_mode_rejects_login_and_never_simulates() {
    let (upstream, mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, false)).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/api/demo/login", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("demo.disabled"));

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", Some("admin-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(mutations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_creates_a_session_counted_by_status() {
    let (upstream, _mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", "/api/demo/status", None))
        .await
        .unwrap();
    let before = body_json(response).await;
    assert_eq!(before["enabled"], json!(true));
    assert_eq!(before["active_sessions"], json!(0));
    assert!(before["last_reset"].is_string());
    assert!(before["next_reset"].is_string());
    assert_eq!(before["reset_interval_hours"], json!(6));
    assert!(before["simulated_actions"]
        .as_array()
        .unwrap()
        .contains(&json!("server.start")));

    let token = login(&app).await;
    assert!(token.starts_with("demo_"));

    let response = app
        .clone()
        .oneshot(request("GET", "/api/demo/status", None))
        .await
        .unwrap();
    let after = body_json(response).await;
    assert_eq!(after["active_sessions"], json!(1));
}

#[tokio::test]
async fn login_carries_the_fixed_demo_permission_set() {
    let (upstream, _mutations) = spawn_upstream_spy().await;
    let app = build_app(test_config(&upstream, true)).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/api/demo/login", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["username"], json!(DEMO_USERNAME));
    assert_eq!(body["is_demo"], json!(true));
    let permissions = body["permissions"].as_array().unwrap();
    assert!(permissions.contains(&json!("players.kick")));
    assert!(permissions.contains(&json!("users.view")));
}

#[tokio::test]
async fn simulation_keeps_working_while_the_upstream_is_down() {
    // nothing listens on this port
    let app = build_app(test_config("http://127.0.0.1:9", true))
        .await
        .unwrap();
    let token = login(&app).await;

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["simulated"], json!(true));
}

#[tokio::test]
async fn proxied_calls_surface_502_when_upstream_is_unreachable() {
    let app = build_app(test_config("http://127.0.0.1:9", true))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", "/api/players", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("upstream.unreachable"));
}

#[tokio::test]
async fn health_answers_locally() {
    let app = build_app(test_config("http://127.0.0.1:9", true))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(request("GET", "/api/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
