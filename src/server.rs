//! Transports for the JSON-RPC endpoint
//!
//! - **streamable-http** (default): `POST /mcp` or `POST /`, plus `GET /health`
//! - **raw-rpc**: line-delimited JSON-RPC over TCP
//! - **stdio**: line-delimited JSON-RPC over stdin/stdout
//!
//! The handler's status snapshot and secret gate are built before any
//! listener is bound, so no request can observe a partially loaded state.
//!
//! HTTP bodies and protocol lines are capped at 1 MiB. An oversized HTTP body
//! gets `413`; an oversized line gets a JSON-RPC `-32600` error and the
//! connection is closed.

use crate::config::{ServerConfig, Transport};
use crate::error::Result;
use crate::rpc::{error_response, RpcHandler, INVALID_REQUEST};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Path the JSON-RPC endpoint is served on
pub const RPC_PATH: &str = "/mcp";

/// Largest accepted HTTP request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Largest accepted line on the line-delimited transports, newline excluded
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Binds the configured transport and serves until the process exits
pub async fn run(config: &ServerConfig, handler: Arc<RpcHandler>) -> Result<()> {
    match config.transport {
        Transport::StreamableHttp => {
            let listener = TcpListener::bind(config.listen_addr).await?;
            serve_http(listener, handler).await
        }
        Transport::RawRpc => {
            let listener = TcpListener::bind(config.listen_addr).await?;
            serve_raw_rpc(listener, handler).await
        }
        Transport::Stdio => serve_stdio(handler).await,
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Collects a request body, refusing one larger than `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> std::result::Result<Bytes, Response<Full<Bytes>>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit, "Request body too large");
            Err(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                serde_json::json!({ "error": format!("Request body exceeds {} bytes", limit) })
                    .to_string(),
            ))
        }
        Err(e) => {
            error!("Failed to read request body: {}", e);
            Err(json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": e.to_string() }).to_string(),
            ))
        }
    }
}

async fn handle_http_request(
    handler: Arc<RpcHandler>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, RPC_PATH) | (&Method::POST, "/") => {
            match read_body(req.into_body(), MAX_BODY_BYTES).await {
                Ok(body_bytes) => match handler.handle(&body_bytes).await {
                    Some(response_bytes) => json_response(StatusCode::OK, response_bytes),
                    None => {
                        let mut accepted = Response::new(Full::new(Bytes::new()));
                        *accepted.status_mut() = StatusCode::ACCEPTED;
                        accepted
                    }
                },
                Err(rejection) => rejection,
            }
        }
        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"Not found"}"#),
    };

    Ok(response)
}

/// Serves JSON-RPC over HTTP on an already bound listener
pub async fn serve_http(listener: TcpListener, handler: Arc<RpcHandler>) -> Result<()> {
    info!(address = %listener.local_addr()?, path = RPC_PATH, "HTTP server listening");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http_request(Arc::clone(&handler), req));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(remote_addr = %remote_addr, error = %e, "Connection error");
            }
        });
    }
}

/// Serves line-delimited JSON-RPC over TCP on an already bound listener
pub async fn serve_raw_rpc(listener: TcpListener, handler: Arc<RpcHandler>) -> Result<()> {
    info!(address = %listener.local_addr()?, "Raw JSON-RPC server listening");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_lines(reader, writer, &handler).await {
                error!(remote_addr = %remote_addr, error = %e, "Read error");
            }
        });
    }
}

/// Serves line-delimited JSON-RPC over stdin/stdout
pub async fn serve_stdio(handler: Arc<RpcHandler>) -> Result<()> {
    info!("Serving JSON-RPC on stdio");
    serve_lines(tokio::io::stdin(), tokio::io::stdout(), &handler).await?;
    info!("stdin closed, shutting down");
    Ok(())
}

/// Answers one JSON-RPC message per line until the reader is exhausted
async fn serve_lines<R, W>(reader: R, mut writer: W, handler: &RpcHandler) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if read > MAX_LINE_BYTES && !line.ends_with('\n') {
            warn!(limit = MAX_LINE_BYTES, "Line too long, closing connection");
            let response = error_response(
                serde_json::Value::Null,
                INVALID_REQUEST,
                format!("Request too large: lines are limited to {} bytes", MAX_LINE_BYTES),
            );
            writer.write_all(&serde_json::to_vec(&response)?).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match handler.handle(trimmed.as_bytes()).await {
            Some(response) => {
                writer.write_all(&response).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            None => debug!("Notification handled, nothing to write"),
        }
    }
}
