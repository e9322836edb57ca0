use std::io::{self, Write};
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "nginx";
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_ERROR_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, clap::Parser)]
#[command(about = "Smoke tests a running nginx deployment")]
pub struct Args {
    #[arg(long, default_value = DEFAULT_HOST, env = "NGINX_HOST")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "HTTP_PORT")]
    pub http_port: u16,

    #[arg(long, default_value_t = DEFAULT_HTTPS_PORT, env = "HTTPS_PORT")]
    pub https_port: u16,

    #[arg(long, default_value_t = DEFAULT_ERROR_PORT, env = "ERROR_PORT")]
    pub error_port: u16,

    #[arg(
        long,
        default_value = "20",
        env = "RATE_LIMIT_REQUESTS",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub rate_limit_requests: u32,

    #[arg(long, default_value = "10", env = "RATE_LIMIT_DELAY_MS")]
    pub rate_limit_delay_ms: u64,

    #[arg(
        long,
        default_value = "2000",
        env = "RATE_LIMIT_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub rate_limit_timeout_ms: u64,

    #[arg(long, value_enum, default_value = "text", env = "OUTPUT_FORMAT")]
    pub format: OutputFormat,
}

impl Args {
    pub fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            http_port: self.http_port,
            https_port: self.https_port,
            error_port: self.error_port,
        }
    }

    pub fn rate_limit_probe(&self) -> RateLimitProbe {
        RateLimitProbe {
            requests: self.rate_limit_requests,
            delay: Duration::from_millis(self.rate_limit_delay_ms),
            timeout: Duration::from_millis(self.rate_limit_timeout_ms),
        }
    }
}

/// The nginx deployment under test: one host, three listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    pub error_port: u16,
}

impl Target {
    pub fn http_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.http_port)
    }

    pub fn https_url(&self) -> String {
        format!("https://{}:{}/", self.host, self.https_port)
    }

    pub fn error_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.error_port)
    }
}

impl Default for Target {
    fn default() -> Self {
        Target {
            host: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            error_port: DEFAULT_ERROR_PORT,
        }
    }
}

/// How hard the rate-limit check leans on the HTTP listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitProbe {
    pub requests: u32,
    /// Sleep after each response, before the next request goes out.
    pub delay: Duration,
    /// Per-request client timeout.
    pub timeout: Duration,
}

impl Default for RateLimitProbe {
    fn default() -> Self {
        RateLimitProbe {
            requests: 20,
            delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Why a check failed. The `Display` text is the reason printed after `FAIL:`.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Could not connect to {url}: {source}")]
    Connect { url: String, source: reqwest::Error },

    #[error("Expected status {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },

    #[error("Could not read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("Response does not appear to be HTML")]
    NotHtml,

    /// A transport error partway through the rate-limit probe. `index` is 1-based.
    #[error("Request {index} failed: {source}")]
    Request { index: u32, source: reqwest::Error },

    #[error("Rate limiting not triggered (all requests succeeded)")]
    RateLimitNotTriggered,
}

impl CheckError {
    /// Extra indented line printed under the failure reason, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CheckError::RateLimitNotTriggered => Some("Expected at least one 503 response"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub successful: u32,
    pub rate_limited: u32,
}

impl RateLimitStats {
    /// Statuses other than 200 and 503 land in neither counter.
    pub fn record(&mut self, status: StatusCode) {
        if status == StatusCode::OK {
            self.successful += 1;
        } else if status == StatusCode::SERVICE_UNAVAILABLE {
            self.rate_limited += 1;
        }
    }

    pub fn triggered(&self) -> bool {
        self.rate_limited > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("could not write report: {0}")]
    Io(#[from] io::Error),

    #[error("could not serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub checks: Vec<CheckReport>,
    pub all_passed: bool,
}

impl SuiteReport {
    pub fn new(checks: Vec<CheckReport>) -> Self {
        let all_passed = checks.iter().all(|check| check.passed);
        SuiteReport { checks, all_passed }
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_passed {
            0
        } else {
            1
        }
    }

    /// Writes the closing summary. In JSON mode this is the only output.
    pub fn print<W: Write>(&self, out: &mut W, format: OutputFormat) -> Result<(), ReportError> {
        match format {
            OutputFormat::Text => {
                writeln!(out, "\n Test Summary ")?;
                if self.all_passed {
                    writeln!(out, "All tests passed!")?;
                } else {
                    writeln!(out, "Some tests failed")?;
                }
            }
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *out, self)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

/// Nginx's default index page uses either case for the root element.
pub fn looks_like_html(body: &str) -> bool {
    body.contains("<html") || body.contains("<HTML")
}

async fn fetch(client: &Client, url: &str) -> Result<Response, CheckError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| CheckError::Connect {
            url: url.to_string(),
            source,
        })?;
    debug!(url, status = %response.status(), "received response");
    Ok(response)
}

fn expect_status(response: &Response, expected: StatusCode) -> Result<(), CheckError> {
    if response.status() != expected {
        return Err(CheckError::UnexpectedStatus {
            expected: expected.as_u16(),
            actual: response.status().as_u16(),
        });
    }
    Ok(())
}

/// `GET /` on the plain HTTP listener must answer 200 with an HTML page.
pub async fn check_http_server(url: &str) -> Result<String, CheckError> {
    let client = Client::builder().build().map_err(CheckError::Client)?;
    let response = fetch(&client, url).await?;
    expect_status(&response, StatusCode::OK)?;

    let body = response.text().await.map_err(CheckError::Body)?;
    if !looks_like_html(&body) {
        return Err(CheckError::NotHtml);
    }

    Ok("Received 200 OK with HTML content".to_string())
}

/// `GET /` over TLS must answer 200. The deployment serves a self-signed
/// certificate, so verification is off.
pub async fn check_https_server(url: &str) -> Result<String, CheckError> {
    let client = Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(CheckError::Client)?;
    let response = fetch(&client, url).await?;
    expect_status(&response, StatusCode::OK)?;

    Ok("HTTPS server responding with 200 OK".to_string())
}

/// The error listener denies everything.
pub async fn check_error_server(url: &str) -> Result<String, CheckError> {
    let client = Client::builder().build().map_err(CheckError::Client)?;
    let response = fetch(&client, url).await?;
    expect_status(&response, StatusCode::FORBIDDEN)?;

    Ok("Error server returning 403 Forbidden".to_string())
}

/// Fires `probe.requests` sequential requests and passes once nginx has
/// answered at least one of them with 503.
pub async fn check_rate_limiting(url: &str, probe: &RateLimitProbe) -> Result<String, CheckError> {
    let client = Client::builder()
        .timeout(probe.timeout)
        .build()
        .map_err(CheckError::Client)?;

    let mut stats = RateLimitStats::default();
    for index in 1..=probe.requests {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|source| CheckError::Request { index, source })?;
        debug!(index, status = %response.status(), "rate limit probe");
        stats.record(response.status());
        drop(response);

        tokio::time::sleep(probe.delay).await;
    }

    if !stats.triggered() {
        return Err(CheckError::RateLimitNotTriggered);
    }

    Ok(format!(
        "Rate limiting working ({} successful, {} rate-limited)",
        stats.successful, stats.rate_limited
    ))
}

fn record<W: Write>(
    out: &mut W,
    format: OutputFormat,
    name: &'static str,
    outcome: Result<String, CheckError>,
) -> io::Result<CheckReport> {
    let text = format == OutputFormat::Text;
    let report = match outcome {
        Ok(detail) => {
            if text {
                writeln!(out, "  PASS: {detail}")?;
            }
            CheckReport {
                name,
                passed: true,
                detail,
            }
        }
        Err(err) => {
            warn!(check = name, error = %err, "check failed");
            if text {
                writeln!(out, "  FAIL: {err}")?;
                if let Some(hint) = err.hint() {
                    writeln!(out, "     {hint}")?;
                }
            }
            CheckReport {
                name,
                passed: false,
                detail: err.to_string(),
            }
        }
    };
    Ok(report)
}

/// Runs the four checks in order, writing progress lines to `out` in text
/// mode. Each check runs regardless of how the previous ones went.
pub async fn run_suite<W: Write>(args: &Args, out: &mut W) -> io::Result<SuiteReport> {
    let target = args.target();
    let probe = args.rate_limit_probe();
    let format = args.format;
    let text = format == OutputFormat::Text;

    info!(?target, ?probe, "starting nginx smoke test");
    if text {
        writeln!(out, "=== F5 DevOps Assignment - Nginx Test Suite ===\n")?;
    }

    let mut checks = Vec::with_capacity(4);

    if text {
        writeln!(out, "[Test 1] HTTP Server (port {})", target.http_port)?;
    }
    let outcome = check_http_server(&target.http_url()).await;
    checks.push(record(out, format, "http", outcome)?);

    if text {
        writeln!(out, "[Test 2] HTTPS Server (port {})", target.https_port)?;
    }
    let outcome = check_https_server(&target.https_url()).await;
    checks.push(record(out, format, "https", outcome)?);

    if text {
        writeln!(out, "[Test 3] Error Server (port {})", target.error_port)?;
    }
    let outcome = check_error_server(&target.error_url()).await;
    checks.push(record(out, format, "error", outcome)?);

    if text {
        writeln!(out, "[Test 4] Rate Limiting")?;
        writeln!(out, "  Sending {} rapid requests...", probe.requests)?;
    }
    let outcome = check_rate_limiting(&target.http_url(), &probe).await;
    checks.push(record(out, format, "rate_limit", outcome)?);

    Ok(SuiteReport::new(checks))
}
