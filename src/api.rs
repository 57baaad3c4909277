//! HTTP API for operators
//!
//! A thin layer over [`ServiceRegistry`]: it decodes JSON bodies, calls one
//! registry operation, and maps the result or [`ServiceError`] to a response.

use crate::error::{json_error_response, ApiErrorCode, ServiceError};
use crate::registry::ServiceRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Body of `POST /api/service/{name}/config` and of each entry in
/// `POST /api/services`
#[derive(Debug, Deserialize)]
pub struct ServicePayload {
    pub config: String,
    pub handler: String,
}

/// Body of `POST /api/service/{name}/running`
#[derive(Debug, Deserialize)]
pub struct RunningPayload {
    pub running: bool,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_or_error<T>(result: Result<T, ServiceError>) -> Response<Full<Bytes>> {
    match result {
        Ok(_) => response(StatusCode::OK, "ok"),
        Err(e) => e.to_response(),
    }
}

/// A file of the built operator UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UiAsset {
    file: &'static str,
    content_type: &'static str,
}

const UI_INDEX: UiAsset = UiAsset {
    file: "index.html",
    content_type: "text/html; charset=utf-8",
};
const UI_BUNDLE: UiAsset = UiAsset {
    file: "build.js",
    content_type: "application/javascript",
};
const UI_SOURCE_MAP: UiAsset = UiAsset {
    file: "build.js.map",
    content_type: "application/json",
};

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Version,
    Ui(UiAsset),
    Services,
    Service(&'a str),
    ServiceConfig(&'a str),
    ServiceRunning(&'a str),
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    match path {
        "/health" => return Route::Health,
        "/version" => return Route::Version,
        "/" => return Route::Ui(UI_INDEX),
        "/dist/build.js" => return Route::Ui(UI_BUNDLE),
        "/dist/build.js.map" => return Route::Ui(UI_SOURCE_MAP),
        "/api/services" | "/api/services/" => return Route::Services,
        _ => {}
    }

    let Some(rest) = path.strip_prefix("/api/service/") else {
        return Route::Unknown;
    };
    let mut segments = rest.split('/');
    let name = segments.next().unwrap_or("");
    if name.is_empty() {
        return Route::Unknown;
    }
    match (segments.next(), segments.next()) {
        (None, _) => Route::Service(name),
        (Some("config"), None) => Route::ServiceConfig(name),
        (Some("running"), None) => Route::ServiceRunning(name),
        _ => Route::Unknown,
    }
}

/// API server exposing the service registry
pub struct ApiServer {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
    ui_dir: Option<Arc<PathBuf>>,
}

impl ApiServer {
    /// Bind the listener. With `auth_token` set, every `/api` route requires
    /// `Authorization: Bearer <token>`.
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            registry,
            shutdown_rx,
            auth_token: auth_token.map(Arc::new),
            ui_dir: None,
        })
    }

    /// Serve the operator UI from `dir` at `/`, `/dist/build.js` and
    /// `/dist/build.js.map`
    pub fn with_ui_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ui_dir = Some(Arc::new(dir.into()));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_token.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, auth = self.auth_enabled(), "API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = self.auth_token.clone();
                            let ui_dir = self.ui_dir.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(stream, registry, auth_token, ui_dir).await
                                {
                                    debug!(addr = %peer, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    registry: Arc<ServiceRegistry>,
    auth_token: Option<Arc<String>>,
    ui_dir: Option<Arc<PathBuf>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = auth_token.clone();
        let ui_dir = ui_dir.clone();
        async move { handle_request(req, registry, token, ui_dir).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected_token)
}

async fn serve_ui(ui_dir: Option<&PathBuf>, asset: UiAsset) -> Response<Full<Bytes>> {
    let Some(dir) = ui_dir else {
        return json_error_response(ApiErrorCode::NotFound, "not found");
    };

    let path = dir.join(asset.file);
    match tokio::fs::read(&path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", asset.content_type)
            .body(Full::new(Bytes::from(contents)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read UI asset");
            json_error_response(ApiErrorCode::NotFound, "not found")
        }
    }
}

/// Collect and decode a JSON body, or produce the 400 response for it
async fn read_json<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<Result<T, Response<Full<Bytes>>>, hyper::Error> {
    let body = req.collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body).map_err(|e| {
        json_error_response(ApiErrorCode::BadRequest, format!("Invalid JSON: {}", e))
    }))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<ServiceRegistry>,
    auth_token: Option<Arc<String>>,
    ui_dir: Option<Arc<PathBuf>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    let route = route(&path);

    if !matches!(
        route,
        Route::Health | Route::Version | Route::Ui(_) | Route::Unknown
    ) {
        if let Some(ref token) = auth_token {
            if !check_auth(&req, token) {
                warn!(%path, "Unauthorized API request");
                return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
            }
        }
    }

    let response = match (method, route) {
        (Method::GET, Route::Health) => response(StatusCode::OK, "ok"),

        (Method::GET, Route::Version) => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (Method::GET, Route::Ui(asset)) => serve_ui(ui_dir.as_deref(), asset).await,

        (Method::GET, Route::Services) => {
            let services: serde_json::Map<String, serde_json::Value> = registry
                .snapshot()
                .into_iter()
                .map(|(name, record)| (name, record.to_json()))
                .collect();
            json_response(StatusCode::OK, serde_json::Value::Object(services).to_string())
        }

        (Method::POST, Route::Services) => {
            let batch: BTreeMap<String, ServicePayload> = match read_json(req).await? {
                Ok(batch) => batch,
                Err(bad_request) => return Ok(bad_request),
            };
            let mut result = Ok(());
            for (name, payload) in &batch {
                if let Err(e) = registry
                    .create_or_update(name, &payload.config, &payload.handler)
                    .await
                {
                    result = Err(e);
                    break;
                }
            }
            ok_or_error(result)
        }

        (Method::GET, Route::Service(name)) => match registry.get(name) {
            Ok(record) => json_response(StatusCode::OK, record.to_json().to_string()),
            Err(e) => e.to_response(),
        },

        (Method::DELETE, Route::Service(name)) => ok_or_error(registry.delete(name).await),

        (Method::POST, Route::ServiceConfig(name)) => {
            let payload: ServicePayload = match read_json(req).await? {
                Ok(payload) => payload,
                Err(bad_request) => return Ok(bad_request),
            };
            ok_or_error(
                registry
                    .create_or_update(name, &payload.config, &payload.handler)
                    .await,
            )
        }

        (Method::POST, Route::ServiceRunning(name)) => {
            let payload: RunningPayload = match read_json(req).await? {
                Ok(payload) => payload,
                Err(bad_request) => return Ok(bad_request),
            };
            ok_or_error(registry.set_running(name, payload.running).await)
        }

        (_, Route::Unknown) => json_error_response(ApiErrorCode::NotFound, "not found"),

        _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parsing() {
        assert_eq!(route("/health"), Route::Health);
        assert_eq!(route("/version"), Route::Version);
        assert_eq!(route("/"), Route::Ui(UI_INDEX));
        assert_eq!(route("/dist/build.js"), Route::Ui(UI_BUNDLE));
        assert_eq!(route("/dist/build.js.map"), Route::Ui(UI_SOURCE_MAP));
        assert_eq!(route("/api/services"), Route::Services);
        assert_eq!(route("/api/service/svc1"), Route::Service("svc1"));
        assert_eq!(route("/api/service/svc1/config"), Route::ServiceConfig("svc1"));
        assert_eq!(route("/api/service/svc1/running"), Route::ServiceRunning("svc1"));
    }

    #[test]
    fn test_route_rejects_malformed_paths() {
        assert_eq!(route("/dist/other.js"), Route::Unknown);
        assert_eq!(route("/api/service/"), Route::Unknown);
        assert_eq!(route("/api/service/svc1/other"), Route::Unknown);
        assert_eq!(route("/api/service/svc1/config/extra"), Route::Unknown);
    }

    #[test]
    fn test_payload_parsing() {
        let payload: ServicePayload =
            serde_json::from_str(r#"{"config": "listen 1", "handler": "h"}"#).unwrap();
        assert_eq!(payload.config, "listen 1");
        assert_eq!(payload.handler, "h");

        let running: RunningPayload = serde_json::from_str(r#"{"running": false}"#).unwrap();
        assert!(!running.running);

        assert!(serde_json::from_str::<RunningPayload>(r#"{"running": "yes"}"#).is_err());
    }
}
