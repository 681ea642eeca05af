//! HTTP gateway.
//!
//! Two axum listeners share one [`AuthzEngine`]:
//!
//! - the decision listener serves `/check` (POST or GET) and `/policy`;
//! - the monitoring listener serves `/metrics` and `/health`.
//!
//! A check request carries the path, method, source and token in headers
//! whose names come from [`HeaderConfig`]. Allow maps to `200`, deny to
//! `403`. A request whose headers cannot be read is denied with the
//! `invalid-request` reason; the gateway never answers a check with 5xx.
//!
//! The decision listener serves HTTPS when TLS files are configured. The
//! monitoring listener is always plain HTTP.

use crate::api::{AuthzEngine, Decision, RequestDescriptor};
use crate::config::{Config, HeaderConfig, TlsConfig};
use crate::{Error, Result};

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::future::try_join;
use futures::FutureExt;
use serde_json::json;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

/// Response header carrying the decision reason.
pub const REASON_HEADER: &str = "x-authz-reason";
/// Response header carrying the matched rule id.
pub const RULE_HEADER: &str = "x-authz-rule";
/// Response header carrying the per-check correlation id.
pub const CHECK_ID_HEADER: &str = "x-authz-check-id";

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// State shared by the decision handlers.
#[derive(Clone)]
pub struct GatewayState {
    engine: Arc<AuthzEngine>,
    headers: Arc<HeaderConfig>,
}

/// Routes of the decision listener.
pub fn router(engine: Arc<AuthzEngine>, headers: HeaderConfig) -> Router {
    let state = GatewayState {
        engine,
        headers: Arc::new(headers),
    };

    Router::new()
        .route("/check", get(check).post(check))
        .route("/policy", get(policy))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Routes of the monitoring listener.
pub fn monitoring_router(engine: Arc<AuthzEngine>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(engine)
}

async fn check(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let check_id = Uuid::new_v4();
    let span = info_span!("check", %check_id);

    let decision = span.in_scope(|| match descriptor(&headers, &state.headers) {
        Ok(desc) => state.engine.check(&desc),
        Err(detail) => {
            debug!(%detail, "rejecting unreadable check request");
            state.engine.invalid_request(&detail)
        }
    });

    respond(decision, check_id)
}

fn descriptor(
    headers: &HeaderMap,
    names: &HeaderConfig,
) -> std::result::Result<RequestDescriptor, String> {
    let path = header(headers, &names.path)?
        .ok_or_else(|| format!("missing `{}` header", names.path))?;
    let method = header(headers, &names.method)?
        .ok_or_else(|| format!("missing `{}` header", names.method))?;
    let source = header(headers, &names.source)?;
    if source.is_none() && names.require_source {
        return Err(format!("missing `{}` header", names.source));
    }

    let token = match header(headers, &names.token)? {
        Some(token) => Some(token),
        None => header(headers, AUTHORIZATION.as_str())?,
    };

    let mut builder = RequestDescriptor::builder()
        .with_path(path)
        .with_method(method);
    if let Some(source) = source {
        builder = builder.with_source(source);
    }
    if let Some(token) = token {
        builder = builder.with_token(token);
    }
    Ok(builder.build())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> std::result::Result<Option<&'a str>, String> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| format!("`{}` header is not valid text", name)),
    }
}

fn respond(decision: Decision, check_id: Uuid) -> Response {
    let status = if decision.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };

    let mut response = (status, Json(decision)).into_response();
    let headers = response.headers_mut();
    headers.insert(REASON_HEADER, HeaderValue::from_static(decision.reason.as_str()));
    if let Some(rule) = decision.matched_rule {
        headers.insert(RULE_HEADER, HeaderValue::from(rule));
    }
    if let Ok(value) = HeaderValue::from_str(&check_id.to_string()) {
        headers.insert(CHECK_ID_HEADER, value);
    }
    response
}

async fn policy(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.engine.summary())
}

async fn metrics(State(engine): State<Arc<AuthzEngine>>) -> Response {
    match engine.telemetry().render() {
        Ok(body) => ([(CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(engine): State<Arc<AuthzEngine>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "generation": engine.generation(),
    }))
}

/// Bind both listeners from the configuration and serve until `shutdown`
/// resolves.
pub async fn serve<F>(engine: Arc<AuthzEngine>, config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let tls = match &config.server.tls {
        Some(files) => Some(load_tls(files).await?),
        None => None,
    };
    let listener = bind(config.server.addr()?).await?;
    let monitoring = bind(config.server.monitoring_addr()?).await?;
    serve_with_listeners(
        engine,
        config.headers.clone(),
        listener,
        monitoring,
        tls,
        shutdown,
    )
    .await
}

/// Read the PEM certificate chain and private key for the decision listener.
pub async fn load_tls(files: &TlsConfig) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&files.cert_file, &files.key_file)
        .await
        .map_err(|e| {
            Error::server(format!(
                "failed to load TLS certificate {} and key {}: {}",
                files.cert_file.display(),
                files.key_file.display(),
                e
            ))
        })
}

/// Serve on already-bound listeners until `shutdown` resolves, then drain
/// in-flight requests on both. With `tls`, the decision listener speaks
/// HTTPS.
pub async fn serve_with_listeners<F>(
    engine: Arc<AuthzEngine>,
    headers: HeaderConfig,
    listener: TcpListener,
    monitoring: TcpListener,
    tls: Option<RustlsConfig>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);

    info!(
        addr = %local_addr(&listener),
        monitoring_addr = %local_addr(&monitoring),
        tls = tls.is_some(),
        "gateway listening"
    );

    let app = router(engine.clone(), headers);
    let checks = match tls {
        Some(tls) => serve_tls(listener, app, tls, stop_rx.clone()).boxed(),
        None => axum::serve(listener, app)
            .with_graceful_shutdown(stopped(stop_rx.clone()))
            .into_future()
            .boxed(),
    };
    let monitor = axum::serve(monitoring, monitoring_router(engine))
        .with_graceful_shutdown(stopped(stop_rx))
        .into_future();

    let trigger = tokio::spawn(async move {
        shutdown.await;
        info!("shutting down gateway");
        let _ = stop_tx.send(true);
    });

    let result = try_join(checks, monitor).await;
    trigger.abort();
    result.map_err(|e| Error::server(format!("listener failed: {}", e)))?;

    info!("gateway stopped");
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: RustlsConfig,
    stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let handle = Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        stopped(stop).await;
        trigger.graceful_shutdown(None);
    });

    axum_server::from_tcp_rustls(listener.into_std()?, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::server(format!("failed to bind {}: {}", addr, e)))
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    // A dropped sender also ends the wait.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Reason;
    use crate::policy::PolicyDocument;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    const FIXTURE: &str = include_str!("../../fixtures/bench_policy.yaml");

    fn engine() -> Arc<AuthzEngine> {
        Arc::new(
            AuthzEngine::builder()
                .with_document(PolicyDocument::from_yaml(FIXTURE).unwrap())
                .with_audit(false)
                .build()
                .unwrap(),
        )
    }

    fn token(user: &str) -> String {
        encode(
            &Header::default(),
            &json!({ "user": user }),
            &EncodingKey::from_secret(b"bench-secret"),
        )
        .unwrap()
    }

    fn check_request(path: &str, source: Option<&str>, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/check")
            .header("x-path", path)
            .header("x-method", "GET");
        if let Some(source) = source {
            builder = builder.header("x-source", source);
        }
        if let Some(token) = token {
            builder = builder.header("token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(engine: Arc<AuthzEngine>, request: Request<Body>) -> (StatusCode, String, String) {
        let response = router(engine, HeaderConfig::default())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let reason = response
            .headers()
            .get(REASON_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, reason, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_jwt_claim_mismatch_is_forbidden() {
        let other = token("someone-else");
        let (status, reason, body) =
            send(engine(), check_request("/jwt_9/9", Some("client1"), Some(&other))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "claims-denied");
        assert!(body.contains("claims-denied"));
    }

    #[tokio::test]
    async fn test_jwt_valid_claims_are_allowed() {
        let engine = engine();
        let valid = token("username");
        let (status, _, _) = send(
            engine.clone(),
            check_request("/jwt_9/9", Some("client1"), Some(&valid)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, reason, _) =
            send(engine, check_request("/jwt_9/9", Some("client1"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "no-token");
    }

    #[tokio::test]
    async fn test_authorization_header_fallback() {
        let valid = format!("Bearer {}", token("username"));
        let request = Request::builder()
            .uri("/check")
            .header("x-path", "/jwt_2/1")
            .header("x-method", "GET")
            .header("x-source", "client1")
            .header("authorization", valid)
            .body(Body::empty())
            .unwrap();
        let (status, reason, _) = send(engine(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reason, "rule-allow");
    }

    #[tokio::test]
    async fn test_nested_regex_rule_is_allowed() {
        let engine = engine();
        let (status, reason, _) = send(
            engine.clone(),
            check_request("/regex_8/1/sub_5/2", Some("client1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reason, "rule-allow");

        let (status, reason, _) =
            send(engine, check_request("/regex_8", Some("client1"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "rule-deny");
    }

    #[tokio::test]
    async fn test_json_rule_checks_source() {
        let engine = engine();
        let (status, _, _) = send(
            engine.clone(),
            check_request("/json_1/1", Some("client1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, reason, _) =
            send(engine, check_request("/json_1/1", Some("client42"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "predicate-denied");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_default_deny() {
        let (status, reason, _) =
            send(engine(), check_request("/nowhere", Some("client1"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, Reason::DefaultDeny.as_str());
    }

    #[tokio::test]
    async fn test_missing_headers_are_invalid_requests() {
        let engine = engine();
        let request = Request::builder()
            .method("POST")
            .uri("/check")
            .header("x-method", "GET")
            .header("x-source", "client1")
            .body(Body::empty())
            .unwrap();
        let (status, reason, body) = send(engine.clone(), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "invalid-request");
        assert!(body.contains("invalid-request"));

        let (status, reason, _) = send(engine.clone(), check_request("/json_1/1", None, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(reason, "invalid-request");

        assert_eq!(
            engine.telemetry().check_count("deny", "invalid-request"),
            2
        );
    }

    #[tokio::test]
    async fn test_source_optional_when_configured() {
        let headers = HeaderConfig {
            require_source: false,
            ..HeaderConfig::default()
        };
        let response = router(engine(), headers)
            .oneshot(check_request("/regex_1/3/sub_1/4", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(RULE_HEADER));
        assert!(response.headers().contains_key(CHECK_ID_HEADER));
    }

    #[tokio::test]
    async fn test_policy_summary() {
        let response = router(engine(), HeaderConfig::default())
            .oneshot(Request::builder().uri("/policy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["name"], "bench");
        assert_eq!(summary["rules"], 9 + 9 + 9 * 10);
        assert_eq!(summary["by_kind"]["jwt"], 9);
    }

    #[tokio::test]
    async fn test_monitoring_routes() {
        let engine = engine();
        send(engine.clone(), check_request("/nowhere", Some("client1"), None)).await;

        let response = monitoring_router(engine.clone())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            METRICS_CONTENT_TYPE
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("authz_check_requests_total"));
        assert!(text.contains("reason=\"default-deny\""));

        let response = monitoring_router(engine)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitoring = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitoring_addr = monitoring.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve_with_listeners(
            engine(),
            HeaderConfig::default(),
            listener,
            monitoring,
            None,
            async move {
                let _ = rx.await;
            },
        ));

        let mut stream = tokio::net::TcpStream::connect(monitoring_addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    fn write_self_signed(dir: &std::path::Path) -> TlsConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let files = TlsConfig {
            cert_file: dir.join("tls.crt"),
            key_file: dir.join("tls.key"),
        };
        std::fs::write(&files.cert_file, certified.cert.pem()).unwrap();
        std::fs::write(&files.key_file, certified.key_pair.serialize_pem()).unwrap();
        files
    }

    #[tokio::test]
    async fn test_load_tls() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_self_signed(dir.path());
        assert!(load_tls(&files).await.is_ok());

        let swapped = TlsConfig {
            cert_file: files.key_file.clone(),
            key_file: files.cert_file.clone(),
        };
        assert!(load_tls(&swapped).await.is_err());

        let missing = TlsConfig {
            cert_file: dir.path().join("absent.crt"),
            key_file: files.key_file,
        };
        let err = load_tls(&missing).await.unwrap_err();
        assert!(err.to_string().contains("absent.crt"));
    }

    #[tokio::test]
    async fn test_tls_listener_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let tls = load_tls(&write_self_signed(dir.path())).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let check_addr = listener.local_addr().unwrap();
        let monitoring = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve_with_listeners(
            engine(),
            HeaderConfig::default(),
            listener,
            monitoring,
            Some(tls),
            async move {
                let _ = rx.await;
            },
        ));

        // A plaintext request never gets an HTTP answer from the TLS listener.
        let mut stream = tokio::net::TcpStream::connect(check_addr).await.unwrap();
        stream
            .write_all(b"GET /policy HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response)).await;
        assert!(!String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
