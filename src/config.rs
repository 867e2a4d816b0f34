//! Configuration management for Quotagate.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use http::HeaderName;

use crate::error::{QuotaError, Result};
use crate::middleware::{ClientIp, FallbackKey, HeaderKey, KeyExtractor, RateLimitMiddleware, StaticKey};
use crate::ratelimit::{Clock, Policy, RateLimiter, DEFAULT_LIMIT, DEFAULT_PERIOD};
use crate::storage::{MemoryStorage, Session, SessionStorage, Storage};

/// Prefix for environment overrides, e.g. `QUOTAGATE__LIMIT=50`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for a Quotagate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Maximum requests per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Path prefix the limiter applies to
    #[serde(default)]
    pub root: String,

    /// Where the quota key comes from
    #[serde(default)]
    pub key: KeyConfig,

    /// Counter storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for QuotagateConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            period_secs: default_period_secs(),
            root: String::new(),
            key: KeyConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_period_secs() -> u64 {
    DEFAULT_PERIOD.as_secs()
}

/// Source of the quota key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// One shared key for all requests
    Static,
    /// A request header, named by `value`
    Header,
    /// The peer address
    ClientIp,
}

/// Key extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Where the key comes from
    #[serde(default = "default_key_source")]
    pub source: KeySource,

    /// The static key, or the header name for `header`
    #[serde(default = "default_key_value")]
    pub value: String,

    /// Static key used when the primary source yields nothing
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            source: default_key_source(),
            value: default_key_value(),
            fallback: None,
        }
    }
}

fn default_key_source() -> KeySource {
    KeySource::Static
}

fn default_key_value() -> String {
    "rate-limit".to_string()
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-wide concurrent map
    Memory,
    /// Namespaced session map
    Session,
    /// Redis cache (requires the `redis` feature)
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend to use
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Namespace (session) or key prefix (redis)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis connect/read/write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            prefix: default_prefix(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_prefix() -> String {
    "rate-limit:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotagateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QuotaError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered with
    /// `QUOTAGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validate the limit and period into a policy.
    pub fn policy(&self) -> Result<Policy> {
        Policy::new(self.limit, Duration::from_secs(self.period_secs))
    }

    /// Build the key extractor described by `key`.
    pub fn key_extractor(&self) -> Result<Box<dyn KeyExtractor>> {
        let primary: Box<dyn KeyExtractor> = match self.key.source {
            KeySource::Static => Box::new(StaticKey::new(self.key.value.clone())),
            KeySource::Header => {
                let name = HeaderName::try_from(self.key.value.as_str()).map_err(|e| {
                    QuotaError::Config(format!("invalid key header '{}': {}", self.key.value, e))
                })?;
                Box::new(HeaderKey::new(name))
            }
            KeySource::ClientIp => Box::new(ClientIp),
        };

        let extractor: Box<dyn KeyExtractor> = match &self.key.fallback {
            Some(fallback) => Box::new(FallbackKey::boxed(
                primary,
                Box::new(StaticKey::new(fallback.clone())),
            )),
            None => primary,
        };
        Ok(extractor)
    }

    /// Wrap `limiter` in a middleware scoped to `root` that keys requests
    /// the way `key` describes.
    pub fn middleware(&self, limiter: Arc<RateLimiter>) -> Result<RateLimitMiddleware> {
        Ok(RateLimitMiddleware::with_boxed_extractor(limiter, self.key_extractor()?)
            .with_root(self.root.clone()))
    }

    /// Build the configured storage backend.
    ///
    /// A session backend gets a fresh [`Session`] scoped to the returned
    /// storage.
    pub fn build_storage(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn Storage>> {
        match self.storage.backend {
            Backend::Memory => Ok(Arc::new(MemoryStorage::with_clock(clock))),
            Backend::Session => Ok(Arc::new(SessionStorage::with_clock(
                &Session::new(),
                self.storage.prefix.clone(),
                clock,
            ))),
            #[cfg(feature = "redis")]
            Backend::Redis => Ok(Arc::new(crate::storage::RedisStorage::open(
                &self.storage.redis_url,
                self.storage.prefix.clone(),
                Duration::from_millis(self.storage.timeout_ms),
            )?)),
            #[cfg(not(feature = "redis"))]
            Backend::Redis => Err(QuotaError::Config(
                "redis backend requires the `redis` feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{RequestContext, Verdict};
    use crate::ratelimit::ManualClock;

    #[test]
    fn test_defaults() {
        let config = QuotagateConfig::default();
        assert_eq!(config.limit, 100);
        assert_eq!(config.period_secs, 3600);
        assert_eq!(config.root, "");
        assert_eq!(config.key.source, KeySource::Static);
        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limit: 3
period_secs: 60
root: /api
key:
  source: header
  value: x-api-key
  fallback: anonymous
storage:
  backend: session
  prefix: api
logging:
  level: debug
  json: true
"#;
        let config = QuotagateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limit, 3);
        assert_eq!(config.period_secs, 60);
        assert_eq!(config.root, "/api");
        assert_eq!(config.key.source, KeySource::Header);
        assert_eq!(config.key.fallback.as_deref(), Some("anonymous"));
        assert_eq!(config.storage.backend, Backend::Session);
        assert_eq!(config.storage.prefix, "api");
        assert_eq!(config.storage.timeout_ms, 250);
        assert!(config.logging.json);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = QuotagateConfig::from_yaml("limit: 7\n").unwrap();
        assert_eq!(config.limit, 7);
        assert_eq!(config.period_secs, 3600);
        assert_eq!(config.key.value, "rate-limit");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = QuotagateConfig::from_yaml("limit: [").unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_policy_validation() {
        let mut config = QuotagateConfig::default();
        assert!(config.policy().is_ok());

        config.limit = 0;
        assert!(matches!(config.policy(), Err(QuotaError::InvalidPolicy(_))));

        config.limit = 5;
        config.period_secs = 0;
        assert!(config.policy().is_err());
    }

    #[test]
    fn test_header_extractor_with_fallback() {
        let mut config = QuotagateConfig::default();
        config.key.source = KeySource::Header;
        config.key.value = "x-api-key".to_string();
        config.key.fallback = Some("anonymous".to_string());
        let extractor = config.key_extractor().unwrap();

        let req = http::Request::builder()
            .header("x-api-key", "abc")
            .body(())
            .unwrap();
        let ctx = RequestContext::from_request(&req, None);
        assert_eq!(extractor.extract(&ctx), Some("abc".to_string()));

        let req = http::Request::new(());
        let ctx = RequestContext::from_request(&req, None);
        assert_eq!(extractor.extract(&ctx), Some("anonymous".to_string()));
    }

    #[test]
    fn test_invalid_header_name() {
        let mut config = QuotagateConfig::default();
        config.key.source = KeySource::Header;
        config.key.value = "bad header".to_string();
        assert!(matches!(config.key_extractor(), Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_build_storage_backends() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let mut config = QuotagateConfig::default();
        assert!(config.build_storage(clock.clone()).is_ok());

        config.storage.backend = Backend::Session;
        assert!(config.build_storage(clock).is_ok());
    }

    #[test]
    fn test_middleware_honours_root_and_key() {
        let yaml = r#"
limit: 1
period_secs: 60
root: /api
key:
  source: static
  value: everyone
"#;
        let config = QuotagateConfig::from_yaml(yaml).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let storage = config.build_storage(clock.clone()).unwrap();
        let limiter = Arc::new(RateLimiter::with_clock(
            config.policy().unwrap(),
            storage.clone(),
            clock,
        ));
        let middleware = config.middleware(limiter).unwrap();

        let health = http::Request::get("/health").body(()).unwrap();
        for _ in 0..3 {
            match middleware.check(&RequestContext::from_request(&health, None)) {
                Verdict::Proceed(headers) => assert!(headers.is_empty()),
                Verdict::Reject(_) => panic!("/health is outside the root"),
            }
        }
        assert_eq!(storage.read("everyone"), None);

        let api = http::Request::get("/api/x").body(()).unwrap();
        assert!(middleware
            .check(&RequestContext::from_request(&api, None))
            .is_proceed());
        assert!(middleware
            .check(&RequestContext::from_request(&api, None))
            .is_reject());
        assert!(storage.read("everyone").is_some());
    }

    #[test]
    fn test_middleware_rejects_bad_key_config() {
        let mut config = QuotagateConfig::default();
        config.key.source = KeySource::Header;
        config.key.value = "bad header".to_string();
        let limiter = Arc::new(RateLimiter::new(
            config.policy().unwrap(),
            Arc::new(MemoryStorage::new()),
        ));
        assert!(matches!(config.middleware(limiter), Err(QuotaError::Config(_))));
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn test_redis_backend_needs_feature() {
        let mut config = QuotagateConfig::default();
        config.storage.backend = Backend::Redis;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        assert!(matches!(config.build_storage(clock), Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_load_without_file() {
        let config = QuotagateConfig::load(None).unwrap();
        assert!(config.limit > 0);
    }
}
