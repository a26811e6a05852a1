//! HTTP surface of the admission service.
//!
//! Liveness, readiness and metrics endpoints, the admission decision endpoint
//! used by proxies, and the operator routes under `/admin`.

pub mod middleware;

use std::future::{ready, Ready};
use std::sync::Arc;

use ::config::ConfigError;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest, HttpResponse, Responder};
use log::debug;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::config::build_policy_table;
use crate::core::admission::{AdmissionController, Verdict};
use crate::core::control_plane::{ControlError, ControlPlane};
use crate::models::Config;
use crate::store::CounterStore;

use self::middleware::denial_response;

const DEFAULT_TOP_LIMIT: usize = 10;

pub struct ApiState {
    pub controller: Arc<AdmissionController>,
    pub control: Arc<ControlPlane>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

impl ApiState {
    pub fn new(
        config: Config,
        store: Arc<dyn CounterStore>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, ConfigError> {
        let policies = Arc::new(build_policy_table(&config)?);
        let controller = Arc::new(AdmissionController::new(&config, policies, store));
        let control = Arc::new(ControlPlane::new(controller.clone(), &config));
        Ok(Self {
            controller,
            control,
            config: Arc::new(config),
            metrics,
        })
    }
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/ready").route(web::get().to(readiness)))
        .service(web::resource("/metrics").route(web::get().to(render_metrics)))
        .service(
            web::resource("/api/v1/admission/check").route(web::post().to(check_admission)),
        )
        .service(
            web::scope("/admin")
                .route("/rate-limits/stats", web::get().to(admin_stats))
                .route("/rate-limits/top-ips", web::get().to(admin_top_ips))
                .route("/rate-limits/status/{identifier}", web::get().to(admin_status))
                .route("/rate-limits/reset/{identifier}", web::delete().to(admin_reset))
                .route("/rate-limits/cleanup", web::post().to(admin_cleanup))
                .route("/rate-limits/config", web::get().to(admin_config))
                .route("/bans", web::post().to(admin_ban))
                .route("/bans/{identifier}", web::get().to(admin_ban_status))
                .route("/bans/{identifier}", web::delete().to(admin_unban)),
        );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Admission check request from a proxy doing sub-request authorisation
#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionCheckRequest {
    /// Caller IP, honoured only from a trusted proxy or an operator token
    #[serde(default)]
    pub identity: Option<String>,
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Serialize)]
struct AdmissionCheckResponse {
    allowed: bool,
    identity: String,
    limit: Option<u32>,
    remaining: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointQuery {
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BanRequest {
    pub identifier: String,
    /// Seconds; the configured DDoS ban duration when absent
    pub duration: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness stays 200 while degraded since admission fails open
async fn readiness(state: web::Data<ApiState>) -> impl Responder {
    let store = state.controller.store();
    let reachable = store.ping().await.is_ok();
    let degraded = state.controller.degraded_status();
    let status = if reachable && !degraded.rate_limit && !degraded.ddos {
        "ready"
    } else {
        "degraded"
    };
    HttpResponse::Ok().json(json!({
        "status": status,
        "backend": store.backend(),
        "store_reachable": reachable,
        "degraded": degraded,
    }))
}

async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Admission check endpoint
pub async fn check_admission(
    state: web::Data<ApiState>,
    http: HttpRequest,
    req: web::Json<AdmissionCheckRequest>,
) -> impl Responder {
    let controller = &state.controller;
    let peer = http.peer_addr().map(|addr| addr.ip());
    let vouched = controller.trusts_peer(peer)
        || state
            .config
            .admin
            .token
            .as_deref()
            .is_some_and(|token| token_matches(bearer_token(&http), token));
    let identity = match req.identity.as_deref() {
        Some(candidate) if vouched => controller.resolve_literal(Some(candidate)),
        supplied => {
            if supplied.is_some() {
                debug!("Ignoring supplied identity from untrusted caller {:?}", peer);
            }
            controller.resolve_identity(http.headers(), peer)
        }
    };
    let method = req.method.to_ascii_uppercase();

    match controller.admit(&req.path, &method, &identity).await {
        Verdict::Admit(limits) => HttpResponse::Ok().json(AdmissionCheckResponse {
            allowed: true,
            identity: identity.to_string(),
            limit: limits.map(|l| l.limit),
            remaining: limits.map(|l| l.remaining),
        }),
        Verdict::Deny(denial) => denial_response(&denial),
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Token comparison whose timing does not depend on where the bytes differ
fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|presented| presented.as_bytes().ct_eq(expected.as_bytes()).into())
}

/// Gate for operator routes: disabled routes are 404, a configured token is required
pub struct AdminAccess;

impl FromRequest for AdminAccess {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut actix_web::dev::Payload) -> Self::Future {
        let Some(state) = req.app_data::<web::Data<ApiState>>() else {
            return ready(Err(actix_web::error::ErrorInternalServerError(
                "admission state missing",
            )));
        };
        let admin = &state.config.admin;
        if !admin.enabled {
            return ready(Err(actix_web::error::ErrorNotFound("not found")));
        }
        let Some(token) = admin.token.as_deref() else {
            return ready(Ok(AdminAccess));
        };
        if token_matches(bearer_token(req), token) {
            ready(Ok(AdminAccess))
        } else {
            ready(Err(ControlError::Unauthorized.into()))
        }
    }
}

async fn admin_stats(
    _: AdminAccess,
    state: web::Data<ApiState>,
) -> Result<HttpResponse, ControlError> {
    let stats = state.control.stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn admin_top_ips(
    _: AdminAccess,
    state: web::Data<ApiState>,
    query: web::Query<TopQuery>,
) -> Result<HttpResponse, ControlError> {
    let limit = query.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    let top = state.control.top_offenders(limit).await?;
    Ok(HttpResponse::Ok().json(json!({ "top_ips": top, "limit": limit })))
}

fn endpoint_or_default(state: &ApiState, query: &EndpointQuery) -> String {
    query
        .endpoint
        .clone()
        .unwrap_or_else(|| state.config.rate_limit.default_category.clone())
}

async fn admin_status(
    _: AdminAccess,
    state: web::Data<ApiState>,
    identifier: web::Path<String>,
    query: web::Query<EndpointQuery>,
) -> Result<HttpResponse, ControlError> {
    let endpoint = endpoint_or_default(&state, &query);
    let status = state.control.status(&identifier, &endpoint).await?;
    Ok(HttpResponse::Ok().json(json!({
        "identifier": identifier.as_str(),
        "status": status,
    })))
}

async fn admin_reset(
    _: AdminAccess,
    state: web::Data<ApiState>,
    identifier: web::Path<String>,
    query: web::Query<EndpointQuery>,
) -> Result<HttpResponse, ControlError> {
    let endpoint = endpoint_or_default(&state, &query);
    let reset = state.control.reset(&identifier, &endpoint).await?;
    Ok(HttpResponse::Ok().json(json!({
        "identifier": identifier.as_str(),
        "endpoint": endpoint,
        "reset": reset,
    })))
}

async fn admin_cleanup(
    _: AdminAccess,
    state: web::Data<ApiState>,
) -> Result<HttpResponse, ControlError> {
    let report = state.control.cleanup().await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn admin_config(_: AdminAccess, state: web::Data<ApiState>) -> HttpResponse {
    HttpResponse::Ok().json(state.control.config_view())
}

async fn admin_ban(
    _: AdminAccess,
    state: web::Data<ApiState>,
    req: web::Json<BanRequest>,
) -> Result<HttpResponse, ControlError> {
    let duration = req
        .duration
        .unwrap_or(state.config.ddos.ban_duration_seconds);
    let reason = req.reason.as_deref().unwrap_or("manual");
    let record = state.control.ban(&req.identifier, duration, reason).await?;
    Ok(HttpResponse::Created().json(record))
}

async fn admin_ban_status(
    _: AdminAccess,
    state: web::Data<ApiState>,
    identifier: web::Path<String>,
) -> Result<HttpResponse, ControlError> {
    let status = state.control.ban_status(&identifier).await?;
    Ok(HttpResponse::Ok().json(status))
}

async fn admin_unban(
    _: AdminAccess,
    state: web::Data<ApiState>,
    identifier: web::Path<String>,
) -> Result<HttpResponse, ControlError> {
    let unbanned = state.control.unban(&identifier).await?;
    Ok(HttpResponse::Ok().json(json!({
        "identifier": identifier.as_str(),
        "unbanned": unbanned,
    })))
}
