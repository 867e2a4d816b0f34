//! Request interceptor around the rate limiter.
//!
//! The middleware scopes limiting to a path prefix, derives the quota key,
//! and turns a [`Decision`] into response headers or a 429 response. It never
//! writes to the transport itself: callers attach the headers from
//! [`Verdict::Proceed`] to their response, or send the response carried by
//! [`Verdict::Reject`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use quotagate::middleware::{ClientIp, RateLimitMiddleware, RequestContext};
//! use quotagate::ratelimit::{Policy, RateLimiter, TimeWindow};
//! use quotagate::storage::MemoryStorage;
//!
//! let limiter = RateLimiter::new(
//!     Policy::per(60, TimeWindow::Minute).unwrap(),
//!     Arc::new(MemoryStorage::new()),
//! );
//! let middleware = RateLimitMiddleware::new(Arc::new(limiter), ClientIp).with_root("/api");
//!
//! let request = http::Request::get("/api/items").body(()).unwrap();
//! let ctx = RequestContext::from_request(&request, Some("10.0.0.1".parse().unwrap()));
//! assert!(middleware.check(&ctx).is_proceed());
//! ```

mod key;

pub use key::{ClientIp, FallbackKey, HeaderKey, KeyExtractor, RequestContext, StaticKey};

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter};

/// Header carrying the policy limit.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-limit");
/// Header carrying the requests left in the window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-remaining");
/// Header carrying the seconds until the window resets.
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-reset");

/// Body of the default rejection.
pub const REJECTION_BODY: &str = "Too Many Requests";

/// Result of running a request through the middleware.
#[derive(Debug)]
pub enum Verdict {
    /// Continue processing. The headers belong on the eventual response.
    Proceed(HeaderMap),
    /// Stop processing and send this response.
    Reject(Response<String>),
}

impl Verdict {
    /// Check if the request may continue.
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed(_))
    }

    /// Check if the request was rejected.
    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject(_))
    }

    /// Unwrap the rejection response, if any.
    pub fn into_response(self) -> Option<Response<String>> {
        match self {
            Verdict::Proceed(_) => None,
            Verdict::Reject(res) => Some(res),
        }
    }
}

/// Hooks invoked after a decision is made.
///
/// Both methods have defaults, so implementors override only what they need.
pub trait DecisionHandler: Send + Sync {
    /// Called when the request is allowed.
    fn on_allow(&self, _ctx: &RequestContext<'_>, _decision: &Decision) {}

    /// Called when the request is denied. Returning a response replaces the
    /// default 429; the quota headers are added to it either way.
    fn on_deny(&self, _ctx: &RequestContext<'_>, _decision: &Decision) -> Option<Response<String>> {
        None
    }
}

/// Rate limiting interceptor.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    extractor: Box<dyn KeyExtractor>,
    root: String,
    handler: Option<Arc<dyn DecisionHandler>>,
}

impl RateLimitMiddleware {
    /// Create a middleware applying `limiter` to every request.
    pub fn new<K: KeyExtractor + 'static>(limiter: Arc<RateLimiter>, extractor: K) -> Self {
        Self::with_boxed_extractor(limiter, Box::new(extractor))
    }

    /// Create a middleware from an already boxed extractor.
    pub fn with_boxed_extractor(limiter: Arc<RateLimiter>, extractor: Box<dyn KeyExtractor>) -> Self {
        Self {
            limiter,
            extractor,
            root: String::new(),
            handler: None,
        }
    }

    /// Only limit requests whose path starts with `root`.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Register allow/deny hooks.
    pub fn with_handler<H: DecisionHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// The wrapped limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one request through the limiter.
    pub fn check(&self, ctx: &RequestContext<'_>) -> Verdict {
        if !ctx.path().starts_with(&self.root) {
            return Verdict::Proceed(HeaderMap::new());
        }

        let key = self.extractor.extract(ctx);
        let decision = self.limiter.evaluate(key.as_deref());

        let headers = if decision.missing_key {
            HeaderMap::new()
        } else {
            quota_headers(&decision)
        };

        if decision.allowed {
            if let Some(handler) = &self.handler {
                handler.on_allow(ctx, &decision);
            }
            return Verdict::Proceed(headers);
        }

        debug!(
            key = ?key,
            path = %ctx.path(),
            limit = decision.limit,
            reset = decision.reset_seconds,
            "Rejecting rate limited request"
        );

        let mut response = self
            .handler
            .as_ref()
            .and_then(|handler| handler.on_deny(ctx, &decision))
            .unwrap_or_else(too_many_requests);

        response.headers_mut().extend(headers);
        if decision.reset_seconds > 0 && !response.headers().contains_key(RETRY_AFTER) {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(decision.reset_seconds));
        }

        Verdict::Reject(response)
    }
}

/// The `X-Rate-Limit-*` headers for a decision.
pub fn quota_headers(decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_seconds));
    headers
}

fn too_many_requests() -> Response<String> {
    let mut response = Response::new(REJECTION_BODY.to_string());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
}
