use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use porta_auth::{OidcAuthenticator, Principal, StreamClaims, StreamTokenIssuer};
use porta_contracts::TransportView;
use porta_upstream::{
    DispatchUpstream, HttpDispatchClient, HttpDispatchConfig, HttpStaffDirectory,
    HttpStaffDirectoryConfig, StaffDirectory,
};
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::filters::{self, StreamQuery};
use crate::rate_limit::MintRateLimiter;
use crate::relay::{self, RelaySettings};
use crate::{enrich, mapper};

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    oidc: Option<OidcAuthenticator>,
    tokens: Arc<StreamTokenIssuer>,
    upstream: Arc<dyn DispatchUpstream>,
    directory: Arc<dyn StaffDirectory>,
    rate_limiter: MintRateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl AppState {
    pub fn new(
        config: GatewayConfig,
        oidc: Option<OidcAuthenticator>,
        upstream: Arc<dyn DispatchUpstream>,
        directory: Arc<dyn StaffDirectory>,
    ) -> Result<Self, StartupError> {
        // Token configuration problems are refused here, at startup, instead
        // of surfacing as per-request failures at mint time.
        let tokens = StreamTokenIssuer::new(
            Some(config.stream_token_secret.as_str()),
            config.stream_token_ttl(),
        )
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: err.message,
        })?;

        let rate_limiter = MintRateLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs.max(1)),
            config.rate_limit_tokens_per_window,
            16_384,
        );

        Ok(Self {
            config,
            oidc,
            tokens: Arc::new(tokens),
            upstream,
            directory,
            rate_limiter,
        })
    }
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let oidc = if config.auth_mode == AuthMode::Oidc {
        let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc auth mode requires oidc config".to_string(),
        })?;

        Some(
            OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
        )
    } else {
        None
    };

    let upstream = HttpDispatchClient::new(HttpDispatchConfig {
        base_url: config.dispatch_url.clone(),
        connect_timeout: Duration::from_millis(config.dispatch_connect_timeout_ms),
        request_timeout: Duration::from_millis(config.dispatch_request_timeout_ms),
    })
    .map_err(|err| StartupError {
        code: "ERR_DISPATCH_UNAVAILABLE",
        message: format!("failed to initialize dispatch client: {}", err),
    })?;

    let directory = HttpStaffDirectory::new(HttpStaffDirectoryConfig {
        base_url: config.directory_url.clone(),
        timeout: Duration::from_millis(config.directory_timeout_ms),
    })
    .map_err(|err| StartupError {
        code: "ERR_DIRECTORY_UNAVAILABLE",
        message: format!("failed to initialize staff directory client: {}", err),
    })?;

    let state = AppState::new(config, oidc, Arc::new(upstream), Arc::new(directory))?;
    Ok(app(state))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/transports", get(list_transports))
        .route("/v1/transports/stream-token", get(stream_token))
        .route("/v1/transports/stream", get(stream))
        .layer(middleware::from_fn(track_http_metrics))
        .with_state(state)
}

async fn track_http_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req.uri().path().to_string();

    let response = next.run(req).await;
    crate::metrics::observe_http_request(
        &route,
        &method,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("dispatch", state.upstream.ping().await.is_ok());
    checks.insert("directory", state.directory.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_principal(&state, &headers).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StreamTokenResponse {
    success: bool,
    token: String,
}

async fn stream_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StreamTokenResponse>, ApiError> {
    let principal = extract_principal(&state, &headers).await?;

    if !state
        .rate_limiter
        .allow(format!("stream-token:{}", principal.subject_id).as_str())
    {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            Some("rate limit exceeded for stream token minting".to_string()),
        ));
    }

    let token = state.tokens.mint(&principal).map_err(|err| {
        tracing::error!(code = err.code, "stream token mint failed");
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "TOKEN_MINT_FAILED",
            Some(err.message),
        )
    })?;

    crate::metrics::inc_stream_token_issued();
    tracing::debug!(subject = %principal.subject_id, "stream token minted");

    Ok(Json(StreamTokenResponse {
        success: true,
        token,
    }))
}

async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    let request_id = extract_request_id(&headers);

    let claims = match authorize_stream(&state, &headers, &query) {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };

    let criteria = match filters::translate(&query) {
        Ok(criteria) => criteria,
        Err(err) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "INVALID_FILTER",
                Some(err.to_string()),
            )
            .into_response();
        }
    };

    let settings = RelaySettings {
        keepalive: state.config.stream_keepalive(),
        channel_capacity: state.config.stream_channel_capacity,
    };

    let rx = match relay::open_stream(
        state.upstream.clone(),
        state.directory.clone(),
        criteria,
        settings,
    )
    .await
    {
        Ok(rx) => rx,
        Err(err) => {
            tracing::error!(request_id, error = %err, "stream setup failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STREAM_SETUP_FAILED",
                Some(err.to_string()),
            )
            .into_response();
        }
    };

    tracing::info!(request_id, subject = %claims.sub, "relay stream opened");

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[derive(Debug, Serialize)]
struct ListTransportsResponse {
    success: bool,
    data: Vec<TransportView>,
}

async fn list_transports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Json<ListTransportsResponse>, ApiError> {
    let _principal = extract_principal(&state, &headers).await?;

    let criteria = filters::translate(&query).map_err(|err| {
        json_error(
            StatusCode::BAD_REQUEST,
            "INVALID_FILTER",
            Some(err.to_string()),
        )
    })?;

    let raw = state.upstream.list_requests(&criteria).await.map_err(|err| {
        tracing::error!(error = %err, "dispatch query failed");
        json_error(
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_UNAVAILABLE",
            Some("transport dispatch service is unavailable".to_string()),
        )
    })?;

    let views = raw.iter().map(mapper::map_record).collect();
    let data = enrich::enrich(state.directory.as_ref(), views).await;

    Ok(Json(ListTransportsResponse {
        success: true,
        data,
    }))
}

/// Stream access is granted by a previously minted capability token, carried
/// in the `token` query parameter because EventSource cannot set headers. A
/// Bearer header is accepted as the fallback for non-browser clients.
fn authorize_stream(
    state: &AppState,
    headers: &HeaderMap,
    query: &StreamQuery,
) -> Result<StreamClaims, ApiError> {
    let token = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .or_else(|| bearer_token(headers));

    let Some(token) = token else {
        return Err(unauthorized());
    };

    state.tokens.verify(&token).map_err(|err| {
        tracing::debug!(code = err.code, "stream token rejected");
        unauthorized()
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

async fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            validate_local_auth_shared_secret(
                headers,
                state.config.local_auth_shared_secret.as_deref(),
            )?;
            let subject_id = extract_principal_id(headers)?;
            let roles = headers
                .get("x-porta-principal-roles")
                .and_then(|v| v.to_str().ok())
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(|r| r.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let department = headers
                .get("x-porta-department")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string());

            Ok(Principal {
                subject_id,
                roles,
                department,
            })
        }
        AuthMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    Some("oidc authenticator is not initialized".to_string()),
                ));
            };

            auth.authenticate(headers).await.map_err(|err| {
                if err.code == "ERR_AUTH_UNAVAILABLE" {
                    json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "AUTH_UNAVAILABLE",
                        Some(err.message),
                    )
                } else {
                    unauthorized()
                }
            })
        }
    }
}

fn validate_local_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get("x-porta-local-auth-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(unauthorized)?;

    if provided_secret != expected_secret {
        return Err(unauthorized());
    }

    Ok(())
}

fn extract_principal_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-porta-principal-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(unauthorized)
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-porta-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn json_error(
    status: StatusCode,
    error: impl Into<String>,
    message: Option<String>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.into(),
            message,
        }),
    )
}

fn unauthorized() -> ApiError {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None)
}
