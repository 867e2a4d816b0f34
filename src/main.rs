use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use clap::Parser;
use http::{HeaderName, HeaderValue, Request, StatusCode};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::{LoggingConfig, QuotagateConfig};
use quotagate::middleware::{RateLimitMiddleware, RequestContext, Verdict};
use quotagate::ratelimit::{Clock, RateLimiter, SystemClock};

/// Run request descriptions read from stdin through the rate limiter.
///
/// Each line is a path followed by optional `name=value` headers, with
/// `ip=ADDR` setting the client address, e.g. `/api/items x-api-key=abc
/// ip=10.0.0.1`. Every line is answered on stdout with one JSON object
/// holding the status the request would get and the headers to send.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the requests allowed per window
    #[arg(long)]
    limit: Option<u64>,

    /// Override the window length in seconds
    #[arg(long)]
    period: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QuotagateConfig::load(cli.config.as_deref())?;
    if let Some(limit) = cli.limit {
        config.limit = limit;
    }
    if let Some(period) = cli.period {
        config.period_secs = period;
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policy = config.policy()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = config.build_storage(clock.clone())?;
    let limiter = Arc::new(RateLimiter::with_clock(policy, storage, clock));
    let middleware = config.middleware(limiter)?;
    info!(
        limit = policy.limit(),
        period_secs = policy.period().as_secs(),
        root = %config.root,
        backend = ?config.storage.backend,
        "Rate limiter initialized"
    );

    tokio::select! {
        result = run(&middleware) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Quotagate stopped");
    Ok(())
}

/// What the limiter would do with one request.
#[derive(Debug, Serialize)]
struct Answer {
    status: u16,
    headers: BTreeMap<String, String>,
}

impl Answer {
    fn new(status: StatusCode, headers: &http::HeaderMap) -> Self {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: status.as_u16(),
            headers,
        }
    }
}

/// Answer every stdin line until EOF.
async fn run(middleware: &RateLimitMiddleware) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let answer = respond(middleware, &line);
        let mut out = serde_json::to_vec(&answer)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Reached end of input");
    Ok(())
}

/// Check one request line.
///
/// Storage backends may block on network I/O, so the check runs with the
/// worker thread handed over to blocking work.
fn respond(middleware: &RateLimitMiddleware, line: &str) -> Answer {
    tokio::task::block_in_place(|| match answer(middleware, line) {
        Ok(answer) => answer,
        Err(e) => {
            warn!(line = %line, "Malformed request line: {}", e);
            Answer::new(StatusCode::BAD_REQUEST, &http::HeaderMap::new())
        }
    })
}

fn answer(middleware: &RateLimitMiddleware, line: &str) -> anyhow::Result<Answer> {
    let mut tokens = line.split_whitespace();
    let path = tokens.next().unwrap_or("/");

    let mut builder = Request::builder().uri(path);
    let mut remote_addr = None;
    for token in tokens {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected name=value, got '{}'", token))?;
        if name == "ip" {
            remote_addr = Some(value.parse::<IpAddr>()?);
        } else {
            builder = builder.header(HeaderName::try_from(name)?, HeaderValue::try_from(value)?);
        }
    }
    let request = builder.body(())?;

    let ctx = RequestContext::from_request(&request, remote_addr);
    Ok(match middleware.check(&ctx) {
        Verdict::Proceed(headers) => Answer::new(StatusCode::OK, &headers),
        Verdict::Reject(response) => Answer::new(response.status(), response.headers()),
    })
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr so stdout carries only decisions
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
