//! Actix middleware running the admission pipeline in front of every route.

use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::{Error, HttpResponse};
use futures::future::{ready, LocalBoxFuture, Ready};
use serde_json::json;

use crate::core::admission::{AdmissionController, Denial, RateLimitHeaders, Verdict};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// 429 response for a denied request
pub fn denial_response(denial: &Denial) -> HttpResponse {
    let mut response = HttpResponse::TooManyRequests();
    response.insert_header((RETRY_AFTER, denial.retry_after));
    if let Some(details) = &denial.limit {
        response
            .insert_header((X_RATELIMIT_LIMIT, details.limit))
            .insert_header((X_RATELIMIT_REMAINING, 0u32))
            .insert_header((X_RATELIMIT_RESET, details.reset_at));
    }
    response.json(json!({
        "error": denial.reason.code(),
        "message": denial.message,
        "retry_after": denial.retry_after,
    }))
}

/// Add `X-RateLimit-*` headers to an admitted response
pub fn annotate(headers: &mut HeaderMap, limits: RateLimitHeaders) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limits.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(limits.remaining));
}

/// Admission control for an actix `App`.
///
/// Bypass paths go straight to the wrapped service. Every other request is
/// resolved to an identity and checked; denials short-circuit with a 429.
#[derive(Clone)]
pub struct AdmissionGate {
    controller: Arc<AdmissionController>,
}

impl AdmissionGate {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdmissionGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AdmissionGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionGateMiddleware {
            service: Rc::new(service),
            controller: self.controller.clone(),
        }))
    }
}

pub struct AdmissionGateMiddleware<S> {
    service: Rc<S>,
    controller: Arc<AdmissionController>,
}

impl<S, B> Service<ServiceRequest> for AdmissionGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let controller = Arc::clone(&self.controller);

        Box::pin(async move {
            let path = req.path().to_string();
            if controller.is_bypass(&path) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let peer = req.peer_addr().map(|addr| addr.ip());
            let identity = controller.resolve_identity(req.headers(), peer);
            let method = req.method().as_str().to_string();

            match controller.admit(&path, &method, &identity).await {
                Verdict::Deny(denial) => {
                    let response = denial_response(&denial);
                    Ok(req.into_response(response).map_into_right_body())
                }
                Verdict::Admit(limits) => {
                    let mut res = service.call(req).await?;
                    if let Some(limits) = limits {
                        annotate(res.headers_mut(), limits);
                    }
                    Ok(res.map_into_left_body())
                }
            }
        })
    }
}
