//! Quota key extraction from requests.

use std::net::IpAddr;

use http::{HeaderMap, HeaderName, Method, Request, Uri};

/// The parts of a request the limiter may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Request method
    pub method: &'a Method,
    /// Request URI
    pub uri: &'a Uri,
    /// Request headers
    pub headers: &'a HeaderMap,
    /// Peer address, when the transport knows it
    pub remote_addr: Option<IpAddr>,
}

impl<'a> RequestContext<'a> {
    /// Borrow the relevant parts of `request`.
    pub fn from_request<B>(request: &'a Request<B>, remote_addr: Option<IpAddr>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            headers: request.headers(),
            remote_addr,
        }
    }

    /// The request path.
    pub fn path(&self) -> &'a str {
        self.uri.path()
    }
}

/// Derives the quota key for a request.
///
/// Returning `None` means no key could be derived, and the request is denied.
pub trait KeyExtractor: Send + Sync {
    /// Produce the key for `ctx`.
    fn extract(&self, ctx: &RequestContext<'_>) -> Option<String>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestContext<'_>) -> Option<String> + Send + Sync,
{
    fn extract(&self, ctx: &RequestContext<'_>) -> Option<String> {
        self(ctx)
    }
}

/// The same key for every request: all traffic shares one bucket.
#[derive(Debug, Clone)]
pub struct StaticKey(String);

impl StaticKey {
    /// Create a static key extractor.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl KeyExtractor for StaticKey {
    fn extract(&self, _ctx: &RequestContext<'_>) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

/// Key taken from a request header, e.g. an API token.
#[derive(Debug, Clone)]
pub struct HeaderKey(HeaderName);

impl HeaderKey {
    /// Create an extractor reading `name`.
    pub fn new(name: HeaderName) -> Self {
        Self(name)
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, ctx: &RequestContext<'_>) -> Option<String> {
        let value = ctx.headers.get(&self.0)?.to_str().ok()?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

/// Key taken from the peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIp;

impl KeyExtractor for ClientIp {
    fn extract(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.remote_addr.map(|ip| ip.to_string())
    }
}

/// Tries `primary` and falls back to `fallback` when it yields nothing.
pub struct FallbackKey {
    primary: Box<dyn KeyExtractor>,
    fallback: Box<dyn KeyExtractor>,
}

impl FallbackKey {
    /// Combine two extractors.
    pub fn new<P, F>(primary: P, fallback: F) -> Self
    where
        P: KeyExtractor + 'static,
        F: KeyExtractor + 'static,
    {
        Self::boxed(Box::new(primary), Box::new(fallback))
    }

    /// Combine two already boxed extractors.
    pub fn boxed(primary: Box<dyn KeyExtractor>, fallback: Box<dyn KeyExtractor>) -> Self {
        Self { primary, fallback }
    }
}

impl KeyExtractor for FallbackKey {
    fn extract(&self, ctx: &RequestContext<'_>) -> Option<String> {
        self.primary
            .extract(ctx)
            .or_else(|| self.fallback.extract(ctx))
    }
}
