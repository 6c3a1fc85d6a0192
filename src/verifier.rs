//! Remote verification of a running service
//!
//! The verifier opens a session with the service's JSON-RPC endpoint,
//! calls the `attestation_status` tool, and evaluates the verdict itself:
//! the service must run inside a hardware enclave and report every secret
//! as loaded.
//!
//! Session flow:
//! ```text
//! verifier                          service
//!    │── TCP connect + HTTP/1.1 ───────▶│
//!    │── initialize ───────────────────▶│
//!    │◀──────────── serverInfo ─────────│
//!    │── notifications/initialized ────▶│
//!    │── tools/call attestation_status ▶│
//!    │◀──────────── status JSON ────────│
//!    └── drop session (connection task aborted)
//! ```
//!
//! Three failure classes are kept apart: the service could not be reached,
//! the service answered but broke the contract, and the service answered
//! with a status that does not verify. Only the last one is an ordinary
//! attestation result.

use crate::error::{Error, Result};
use crate::rpc::{RpcRequest, RpcResponse, PROTOCOL_VERSION, STATUS_TOOL};
use crate::status::AttestationStatus;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{Builder, SendRequest};
use hyper::header::{HeaderValue, ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Endpoint used when none is given
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080/mcp";

/// Upper bound on a whole verification session
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "mcp-session-id";

/// Verifier settings
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub endpoint: String,
    pub timeout: Duration,
    /// Secrets that must be reported and loaded, on top of whatever the service declares
    pub required_secrets: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl VerifierConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            required_secrets: Vec::new(),
        }
    }
}

/// How a verification ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Enclave present and all secrets loaded
    Verified,
    /// Reachable and well-formed, but the verdict is false
    NotVerified,
    /// Connection refused, reset or timed out
    Unreachable,
    /// The service answered but violated the response contract
    ProtocolError,
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Verified => 0,
            Outcome::NotVerified | Outcome::Unreachable | Outcome::ProtocolError => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Verified => "VERIFIED",
            Outcome::NotVerified => "NOT VERIFIED",
            Outcome::Unreachable => "COULD NOT VERIFY",
            Outcome::ProtocolError => "PROTOCOL ERROR",
        }
    }
}

/// The result of one verification run
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub endpoint: String,
    pub reachable: bool,
    pub status: Option<AttestationStatus>,
    pub verdict: bool,
    /// Required secrets the service did not report at all
    pub unreported_secrets: Vec<String>,
    /// Why no status could be obtained
    pub failure: Option<String>,
}

impl VerificationResult {
    fn unreachable(endpoint: &str, error: &Error) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            reachable: false,
            status: None,
            verdict: false,
            unreported_secrets: Vec::new(),
            failure: Some(error.to_string()),
        }
    }

    fn protocol_error(endpoint: &str, error: &Error) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            reachable: true,
            status: None,
            verdict: false,
            unreported_secrets: Vec::new(),
            failure: Some(error.to_string()),
        }
    }

    /// Evaluates a status received from the service
    pub fn from_status(endpoint: &str, status: AttestationStatus, required: &[String]) -> Self {
        let unreported_secrets: Vec<String> = required
            .iter()
            .filter(|name| !status.secrets_loaded.contains_key(name.as_str()))
            .cloned()
            .collect();
        let verdict = compute_verdict(&status, required);

        Self {
            endpoint: endpoint.to_string(),
            reachable: true,
            status: Some(status),
            verdict,
            unreported_secrets,
            failure: None,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match (&self.status, self.reachable, self.verdict) {
            (_, false, _) => Outcome::Unreachable,
            (None, true, _) => Outcome::ProtocolError,
            (Some(_), true, true) => Outcome::Verified,
            (Some(_), true, false) => Outcome::NotVerified,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome().exit_code()
    }
}

/// Enclave present, every reported secret loaded, and every required secret reported and loaded
pub fn compute_verdict(status: &AttestationStatus, required: &[String]) -> bool {
    status.verdict()
        && required
            .iter()
            .all(|name| status.secrets_loaded.get(name).unwrap_or(false))
}

/// Connects to a service and checks its attestation status
#[derive(Debug, Clone)]
pub struct RemoteVerifier {
    config: VerifierConfig,
}

impl RemoteVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Runs one verification session, bounded by the configured timeout
    ///
    /// Never fails; every failure is folded into the returned result.
    pub async fn verify(&self) -> VerificationResult {
        let endpoint = self.config.endpoint.as_str();
        let start = Instant::now();
        info!(endpoint = %endpoint, timeout_ms = self.config.timeout.as_millis(), "Verifying service");

        let fetched = match tokio::time::timeout(self.config.timeout, fetch_status(endpoint)).await {
            Ok(fetched) => fetched,
            Err(_) => Err(Error::Timeout(self.config.timeout.as_millis())),
        };

        let result = match fetched {
            Ok(status) => {
                VerificationResult::from_status(endpoint, status, &self.config.required_secrets)
            }
            Err(e) if e.is_connectivity() => {
                warn!(endpoint = %endpoint, error = %e, "Service unreachable");
                VerificationResult::unreachable(endpoint, &e)
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Service violated the status contract");
                VerificationResult::protocol_error(endpoint, &e)
            }
        };

        info!(
            outcome = result.outcome().label(),
            elapsed_ms = start.elapsed().as_millis(),
            "Verification finished"
        );
        result
    }
}

/// Opens a session, queries the status, and releases the session
async fn fetch_status(endpoint: &str) -> Result<AttestationStatus> {
    let target = Endpoint::parse(endpoint)?;
    let mut session = Session::connect(target).await?;

    let server_info = session
        .call(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "attest-verify",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
        )
        .await?;
    debug!(server_info = %server_info, "Session initialized");

    session.notify("notifications/initialized").await?;

    let result = session
        .call(
            "tools/call",
            Some(serde_json::json!({ "name": STATUS_TOOL, "arguments": {} })),
        )
        .await?;

    parse_tool_result(&result)
}

/// Extracts the status from a `tools/call` result
pub fn parse_tool_result(result: &serde_json::Value) -> Result<AttestationStatus> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::Protocol("Tool result has no text content".to_string()))?;

    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        return Err(Error::Protocol(format!("Tool reported an error: {}", text)));
    }

    serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("Malformed status payload: {}", e)))
}

/// Host, port and path of an `http://` endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl Endpoint {
    fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Connect(format!("Invalid endpoint {}: {}", url, e)))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(Error::Connect(format!("Unsupported scheme {}", other)));
            }
            None => return Err(Error::Connect(format!("Endpoint {} has no scheme", url))),
        }

        let host = uri
            .host()
            .ok_or_else(|| Error::Connect(format!("Endpoint {} has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.clone());
        let path = match uri.query() {
            Some(query) => format!("{}?{}", uri.path(), query),
            None => uri.path().to_string(),
        };

        Ok(Self {
            host,
            port,
            authority,
            path,
        })
    }
}

/// One HTTP/1.1 connection to the service
///
/// Dropping the session aborts the connection task, so every exit path,
/// including a timeout that cancels the enclosing future, releases it.
struct Session {
    endpoint: Endpoint,
    sender: SendRequest<Full<Bytes>>,
    connection: JoinHandle<()>,
    session_id: Option<HeaderValue>,
    next_id: u64,
}

impl Session {
    async fn connect(endpoint: Endpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| {
                Error::Connect(format!(
                    "Cannot connect to {}:{}: {}",
                    endpoint.host, endpoint.port, e
                ))
            })?;

        let (sender, conn) = Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Connect(format!("HTTP handshake failed: {}", e)))?;

        let connection = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Connection closed with error");
            }
        });

        Ok(Self {
            endpoint,
            sender,
            connection,
            session_id: None,
            next_id: 1,
        })
    }

    /// Sends a request and returns its result
    async fn call(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let response = self
            .send(&RpcRequest::call(method, params, id), Some(id))
            .await?
            .ok_or_else(|| Error::Protocol(format!("Empty response to {}", method)))?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!(
                "{} failed with code {}: {}",
                method, error.code, error.message
            )));
        }
        if response.id != serde_json::Value::from(id) {
            return Err(Error::Protocol(format!(
                "Response id {} does not match request id {}",
                response.id, id
            )));
        }
        response
            .result
            .ok_or_else(|| Error::Protocol(format!("Response to {} has no result", method)))
    }

    /// Sends a notification; whatever body comes back is discarded
    async fn notify(&mut self, method: &str) -> Result<()> {
        self.send(&RpcRequest::notification(method), None).await?;
        Ok(())
    }

    /// Posts one message and, when `expected_id` is set, returns the response carrying that id
    async fn send(
        &mut self,
        message: &RpcRequest,
        expected_id: Option<u64>,
    ) -> Result<Option<RpcResponse>> {
        let body = serde_json::to_vec(message)?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.path.as_str())
            .header(HOST, self.endpoint.authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream");
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id.clone());
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Protocol(format!("Failed to build request: {}", e)))?;

        self.sender.ready().await.map_err(classify_hyper_error)?;
        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(classify_hyper_error)?;

        let (parts, body) = response.into_parts();
        if let Some(session_id) = parts.headers.get(SESSION_HEADER) {
            self.session_id = Some(session_id.clone());
        }

        let body_bytes = body.collect().await.map_err(classify_hyper_error)?.to_bytes();

        if !parts.status.is_success() {
            return Err(Error::Protocol(format!(
                "{} returned HTTP {}",
                message.method, parts.status
            )));
        }
        let Some(id) = expected_id else {
            return Ok(None);
        };
        if parts.status == StatusCode::ACCEPTED || body_bytes.is_empty() {
            return Ok(None);
        }

        let is_event_stream = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let payload = if is_event_stream {
            let text = std::str::from_utf8(&body_bytes)
                .map_err(|e| Error::Protocol(format!("Event stream is not UTF-8: {}", e)))?;
            sse_response(text, id)
                .ok_or_else(|| {
                    Error::Protocol(format!("Event stream carried no response to request {}", id))
                })?
                .into_bytes()
        } else {
            body_bytes.to_vec()
        };

        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("Malformed JSON-RPC response: {}", e)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn classify_hyper_error(e: hyper::Error) -> Error {
    if e.is_parse() || e.is_parse_status() || e.is_parse_too_large() {
        Error::Protocol(format!("Invalid HTTP response: {}", e))
    } else {
        Error::Connect(format!("Connection failed: {}", e))
    }
}

/// Data payloads of every event in a server-sent event stream, in order
fn sse_events(stream: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();
    for line in stream.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !data.is_empty() {
        events.push(data.join("\n"));
    }
    events
}

/// The first event that answers request `id`
///
/// Server notifications and responses to other requests may share the
/// stream; they are skipped.
fn sse_response(stream: &str, id: u64) -> Option<String> {
    let expected = serde_json::Value::from(id);
    sse_events(stream).into_iter().find(|data| {
        serde_json::from_str::<serde_json::Value>(data).is_ok_and(|message| {
            message.get("method").is_none() && message.get("id") == Some(&expected)
        })
    })
}

const CHECK: &str = "\u{2713}";
const CROSS: &str = "\u{2717}";

fn mark(ok: bool) -> &'static str {
    if ok {
        CHECK
    } else {
        CROSS
    }
}

/// Human-readable report; secret values are never part of it
impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self.outcome();

        writeln!(f, "Endpoint:      {}", self.endpoint)?;
        writeln!(f)?;
        writeln!(f, "Attestation Report")?;
        writeln!(f, "{}", "=".repeat(45))?;

        match &self.status {
            Some(status) => {
                writeln!(f, "Server:        {} v{}", status.server, status.version)?;
                writeln!(
                    f,
                    "TEE detected:  {}  ({})",
                    mark(status.running_in_tee),
                    status.tee_type
                )?;
                writeln!(f, "Secrets:")?;
                for (name, loaded) in status.secrets_loaded.iter() {
                    writeln!(f, "  {:<26}{}", name, mark(loaded))?;
                }
                for name in &self.unreported_secrets {
                    writeln!(f, "  {:<26}{}  (not reported)", name, CROSS)?;
                }
                writeln!(f, "Timestamp:     {}", status.timestamp.to_rfc3339())?;
                writeln!(f)?;

                if !status.running_in_tee {
                    writeln!(
                        f,
                        "WARNING  Not running in a TEE (expected for local development)."
                    )?;
                }
                let mut missing: Vec<&str> = status.missing_secrets();
                missing.extend(self.unreported_secrets.iter().map(String::as_str));
                if !missing.is_empty() {
                    writeln!(f, "WARNING  Missing secrets: {}", missing.join(", "))?;
                }
                if outcome == Outcome::Verified {
                    writeln!(f, "OK  Server is attested and all secrets are loaded.")?;
                }
            }
            None => {
                let reason = self.failure.as_deref().unwrap_or("unknown failure");
                match outcome {
                    Outcome::Unreachable => {
                        writeln!(f, "ERROR  Could not reach the service: {}", reason)?;
                    }
                    _ => {
                        writeln!(f, "ERROR  The service broke the status contract: {}", reason)?;
                    }
                }
            }
        }

        writeln!(f, "Result:        {}", outcome.label())
    }
}
