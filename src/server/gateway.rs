//! Authorization gateway
//!
//! HTTP/1.1 server on `hyper` and `tokio`. Each connection runs in its own
//! task; the only state shared between them is [`GatewayState`], passed
//! explicitly as an `Arc`.
//!
//! # Request pipeline
//!
//! ```text
//! route lookup ─▶ method check ─▶ bearer extraction ─▶ verify ─▶ authorize ─▶ handler
//!     404             405              401              401        403         200
//! ```
//!
//! Rejections carry a generic body. The specific reason is only logged, so a
//! caller cannot probe which check failed.
//!
//! # Example
//!
//! ```no_run
//! use komainu::config::Config;
//! use komainu::server::GatewayServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let server = GatewayServer::new(config).await?;
//! println!("listening on {}", server.local_addr());
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::auth::{
    bearer_token, AuthError, HttpKeySetSource, KeyResolver, TokenVerifier, ValidatedClaims,
};
use crate::authz::{authorize, Decision};
use crate::config::Config;
use crate::metrics;
use crate::router::{Route, RouteAccess, RouteTable};
use crate::server::ServerError;
use hyper::header::{HeaderValue, ALLOW, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// State shared by all connections
pub struct GatewayState {
    verifier: TokenVerifier,
    routes: RouteTable,
    metrics_enabled: bool,
}

impl GatewayState {
    pub fn new(verifier: TokenVerifier, routes: RouteTable) -> Self {
        Self {
            verifier,
            routes,
            metrics_enabled: true,
        }
    }

    /// Serve `GET /metrics`
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Build the verifier, key resolver and route table from configuration
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let auth = &config.auth;
        let jwks_url = auth.jwks_url();

        let source = HttpKeySetSource::new(&jwks_url, auth.jwks.timeout())
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;
        let resolver = KeyResolver::new(Arc::new(source), auth.jwks.resolver_options());

        let verifier = TokenVerifier::new(Arc::new(resolver), &auth.issuer, &auth.audience)
            .with_algorithms(auth.algorithms())
            .with_leeway(auth.leeway_seconds);

        let routes = RouteTable::from_config(&config.routes)
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        info!(
            issuer = %auth.issuer,
            audience = %auth.audience,
            jwks_url = %jwks_url,
            routes = routes.routes().len(),
            "Gateway configured"
        );

        Ok(Self::new(verifier, routes).with_metrics(config.metrics.enabled))
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

/// Authorization gateway server
///
/// # Fields
///
/// * `state` - Verifier and routes (shared across connections)
/// * `listener` - TCP listener for accepting connections
/// * `local_addr` - The actual address the server is bound to
pub struct GatewayServer {
    state: Arc<GatewayState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GatewayServer {
    /// Build the gateway from configuration and bind it.
    ///
    /// The key set is fetched once up front. A failure here is logged, not
    /// fatal: the resolver fetches again on the first request.
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let state = GatewayState::from_config(&config)?;

        match state.verifier.resolver().refresh().await {
            Ok(set) => info!(keys = set.len(), "Key set loaded"),
            Err(e) => warn!(error = %e, "Key set warm-up failed"),
        }

        Self::bind(&config.server.address, Arc::new(state)).await
    }

    /// Bind to `address` with prepared state. Port 0 picks a free port.
    pub async fn bind(address: &str, state: Arc<GatewayState>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        // Actual bound address (important for port 0)
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    /// The socket address (IP + port) the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the process exits
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connection errors are logged and do not stop the server.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting gateway on {}", self.local_addr);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down gateway");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle_request(req, &state).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Handle one HTTP request
///
/// # Endpoints
///
/// * `GET /health` - liveness, always `ok`
/// * `GET /metrics` - Prometheus text format, when enabled
/// * configured routes - authorized according to their [`RouteAccess`]
///
/// The request body is never read.
pub async fn handle_request<B>(req: Request<B>, state: &GatewayState) -> Response<String> {
    let (parts, _) = req.into_parts();
    let path = parts.uri.path().to_string();
    let method = parts.method.clone();

    debug!("Handling {} {}", method, path);

    if method == Method::GET && path == "/health" {
        return text_response(StatusCode::OK, "ok");
    }

    if method == Method::GET && path == "/metrics" && state.metrics_enabled {
        return match metrics::gather_text() {
            Ok(body) => text_response(StatusCode::OK, body),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
    }

    let Some(route) = state.routes.find(&path) else {
        debug!("No route configured for path: {}", path);
        metrics::record_response("none", StatusCode::NOT_FOUND.as_u16());
        return error_response(StatusCode::NOT_FOUND, "not_found");
    };

    let response = route_request(&parts, route, state).await;
    metrics::record_response(&route.name, response.status().as_u16());
    response
}

async fn route_request(req: &Parts, route: &Route, state: &GatewayState) -> Response<String> {
    if !route.allows_method(req.method.as_str()) {
        let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed");
        if let Ok(allow) = HeaderValue::from_str(&route.methods.join(", ")) {
            response.headers_mut().insert(ALLOW, allow);
        }
        return response;
    }

    let identity = match &route.access {
        RouteAccess::Public => None,
        RouteAccess::Protected(required) => {
            let header = req
                .headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());

            let claims = match authenticate(header, state).await {
                Ok(claims) => claims,
                Err(e) => return unauthorized(&e),
            };

            match authorize(&claims, required) {
                Decision::Allow => {
                    metrics::record_authz_decision(true);
                    Some(claims)
                }
                Decision::Deny { missing } => {
                    metrics::record_authz_decision(false);
                    warn!(
                        subject = %claims.subject(),
                        route = %route.name,
                        missing = ?missing,
                        "Insufficient permission"
                    );
                    return forbidden(&missing);
                }
            }
        }
    };

    respond(route, identity.as_ref())
}

async fn authenticate(
    header: Option<&str>,
    state: &GatewayState,
) -> Result<ValidatedClaims, AuthError> {
    let token = bearer_token(header).inspect_err(|_| {
        warn!("Missing or malformed Authorization header");
    })?;
    state.verifier.verify(token).await
}

/// Built-in handler: echoes the route message and the caller's identity
fn respond(route: &Route, identity: Option<&ValidatedClaims>) -> Response<String> {
    let message = route.message.clone().unwrap_or_else(|| match identity {
        Some(_) => format!("Hello from {}! You are authenticated.", route.name),
        None => format!("Hello from {}! No authentication needed.", route.name),
    });

    let body = match identity {
        Some(claims) => json!({
            "message": message,
            "route": route.name,
            "subject": claims.subject(),
            "permissions": claims.permissions(),
        }),
        None => json!({
            "message": message,
            "route": route.name,
        }),
    };

    json_response(StatusCode::OK, body)
}

fn unauthorized(error: &AuthError) -> Response<String> {
    let challenge = match error {
        AuthError::MissingAuth => r#"Bearer realm="komainu""#,
        _ => r#"Bearer realm="komainu", error="invalid_token""#,
    };
    let mut response = error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
    response
}

fn forbidden(missing: &[String]) -> Response<String> {
    let mut response = json_response(
        StatusCode::FORBIDDEN,
        json!({ "error": "insufficient_permission", "missing": missing }),
    );
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Bearer realm="komainu", error="insufficient_scope""#),
    );
    response
}

fn error_response(status: StatusCode, error: &str) -> Response<String> {
    json_response(status, json!({ "error": error }))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<String> {
    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<String> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
