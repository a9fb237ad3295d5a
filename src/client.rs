//! Agent runtime: dials the ingress, authenticates, then serves relayed
//! requests against the local service, reconnecting as needed.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::io::AsyncWriteExt;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::framing::{read_frame, write_frame};
use crate::mux::{MuxSession, SubStream};
use crate::protocol::{AuthRequest, AuthResponse, AUTO_HOSTNAME};
use crate::relay::{self, RelayedRequest};

pub const DEFAULT_SERVER: &str = "tunnel.n.sbn.lol:9000";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Deadline for pushing a framed response back through the tunnel.
const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on one round-trip against the local service.
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for in-flight sub-streams during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Requested hostname, or `AUTO` for server-assigned.
    pub hostname: String,
    /// `host:port` of the local service to expose.
    pub local: String,
    /// Ingress tunnel address.
    pub server: String,
    pub reconnect_delay: Duration,
    /// Keep the caller's `X-Forwarded-For` chain on forwarded requests.
    pub preserve_ip: bool,
    pub auth_token: String,
}

/// The ingress refused the handshake. Never retried on a first connection.
#[derive(Debug, Error)]
#[error("authentication failed: {reason}")]
pub struct AuthFailure {
    pub reason: String,
}

/// Connection loop with reconnect. Fails fast when the very first connection
/// attempt cannot be established or authenticated; afterwards transport
/// errors trigger a reconnect that re-requests the assigned hostname.
pub async fn run_agent(cfg: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    let mut hostname = if cfg.hostname.is_empty() {
        AUTO_HOSTNAME.to_string()
    } else {
        cfg.hostname.clone()
    };
    let mut authenticated_once = false;

    info!("agent starting up");
    while !shutdown.is_cancelled() {
        match connect_and_serve(&cfg, &mut hostname, &mut authenticated_once, &shutdown).await {
            Ok(()) => break,
            Err(err) => {
                if err.is::<AuthFailure>() {
                    return Err(err);
                }
                if !authenticated_once {
                    return Err(err.context("first connection to ingress failed"));
                }
                warn!(
                    "connection error: {err:#}; reconnecting to '{hostname}' in {}",
                    humantime::format_duration(cfg.reconnect_delay)
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(cfg.reconnect_delay) => {}
                }
            }
        }
    }
    info!("agent shut down");
    Ok(())
}

/// One session: dial, authenticate, serve accepted sub-streams until the
/// session dies (error) or shutdown is requested (clean return).
async fn connect_and_serve(
    cfg: &AgentConfig,
    hostname: &mut String,
    authenticated_once: &mut bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!("connecting to ingress at {}", cfg.server);
    let conn = TcpStream::connect(&cfg.server)
        .await
        .with_context(|| format!("failed to connect to {}", cfg.server))?;
    let (session, mut incoming) = MuxSession::client(conn);

    let mut auth_stream = session
        .open_stream()
        .await
        .context("failed to open auth stream")?;
    let request = AuthRequest::new(cfg.auth_token.clone(), hostname.clone());
    write_frame(&mut auth_stream, &request.encode())
        .await
        .context("failed to send auth request")?;
    let payload = read_frame(&mut auth_stream)
        .await
        .context("failed to read auth response")?;
    let _ = auth_stream.close().await;

    match AuthResponse::decode(&payload) {
        AuthResponse::Ok(assigned) => {
            info!("tunnel established: https://{assigned} -> {}", cfg.local);
            *hostname = assigned;
            *authenticated_once = true;
        }
        AuthResponse::Fail(reason) => {
            session.close();
            return Err(AuthFailure { reason }.into());
        }
    }

    loop {
        tokio::select! {
            stream = incoming.next() => match stream {
                Some(stream) => {
                    let local = cfg.local.clone();
                    let preserve_ip = cfg.preserve_ip;
                    tokio::spawn(handle_stream(stream, local, preserve_ip));
                }
                None => bail!("ingress closed the session"),
            },
            _ = shutdown.cancelled() => {
                info!("shutting down tunnel");
                tokio::time::sleep(SHUTDOWN_DRAIN).await;
                session.close();
                return Ok(());
            }
        }
    }
}

/// Serves one relayed request: decode, forward to the local service, frame
/// the response back. Local failures become a synthesized 502 so the HTTP
/// contract with the ingress holds even when the local service is down.
async fn handle_stream(mut stream: SubStream, local: String, preserve_ip: bool) {
    let payload = match read_frame(&mut stream).await {
        Ok(payload) => payload,
        Err(err) => {
            error!("failed to read relayed request: {err}");
            return;
        }
    };
    let request = match relay::decode_request(&payload) {
        Ok(request) => request,
        Err(err) => {
            error!("failed to parse relayed request: {err}");
            return;
        }
    };

    let noisy = request.target.contains(relay::NOISE_PATH_MARKER);
    if !noisy {
        let source = request
            .headers
            .get(relay::X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");
        info!("request: {} {} (from {source})", request.method, request.target);
    }

    let frame = match timeout(
        LOCAL_REQUEST_TIMEOUT,
        forward_to_local(&request, &local, preserve_ip),
    )
    .await
    {
        Ok(Ok((status, frame))) => {
            if !noisy {
                info!("response: {status}");
            }
            frame
        }
        Ok(Err(err)) => {
            warn!("local forward failed: {err:#}");
            bad_gateway_frame()
        }
        Err(_) => {
            warn!("local request to {local} timed out");
            bad_gateway_frame()
        }
    };

    match timeout(RESPONSE_WRITE_TIMEOUT, write_frame(&mut stream, &frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("failed to write response frame: {err}"),
        Err(_) => error!("response write deadline expired"),
    }
    let _ = stream.close().await;
}

/// Performs the relayed request against the local service over a fresh
/// http1 connection and returns the response as a frame payload.
async fn forward_to_local(
    request: &RelayedRequest,
    local: &str,
    preserve_ip: bool,
) -> Result<(StatusCode, Vec<u8>)> {
    let stream = TcpStream::connect(local)
        .await
        .with_context(|| format!("failed to connect to local service {local}"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("local connection error: {err}");
        }
    });

    let uri: hyper::Uri = request
        .target
        .parse()
        .with_context(|| format!("invalid request target {}", request.target))?;
    let mut builder = hyper::Request::builder()
        .method(request.method.clone())
        .uri(uri);
    for (name, value) in &request.headers {
        // The public hostname must not reach local routing; hyper recomputes
        // the length for the exact body we carry.
        if *name == HOST || *name == CONTENT_LENGTH {
            continue;
        }
        if !preserve_ip && name.as_str() == relay::X_FORWARDED_FOR {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(HOST, local);
    let local_request = builder.body(Full::new(request.body.clone()))?;

    let response = sender
        .send_request(local_request)
        .await
        .context("local request failed")?;
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .context("failed to read local response body")?
        .to_bytes();
    Ok((
        parts.status,
        relay::encode_response(parts.status, &parts.headers, &body),
    ))
}

fn bad_gateway_frame() -> Vec<u8> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    relay::encode_response(
        StatusCode::BAD_GATEWAY,
        &headers,
        b"Failed to forward to local service",
    )
}
