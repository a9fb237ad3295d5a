//! Public ingress: accepts agent tunnel connections on one port and inbound
//! HTTP on another, routing each HTTP request over a fresh tunnel sub-stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::io::AsyncWriteExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::framing::{read_frame, write_frame};
use crate::hostname;
use crate::mux::{IncomingStreams, MuxSession, SubStream};
use crate::protocol::{AuthRequest, AuthResponse};
use crate::registry::{RegistryError, TunnelEntry, TunnelRegistry};
use crate::relay;
use crate::validator::TokenValidator;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Covers AWAIT-AUTH-STREAM through REPLY for a freshly accepted agent.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for pushing one framed request into the tunnel.
const RELAY_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the agent's framed response.
const RELAY_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on AUTO hostname allocation retries before the handshake fails.
const MAX_HOSTNAME_ATTEMPTS: usize = 32;

const FALLBACK_ERROR_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Tunnel not connected</title></head>\n<body><h1>503</h1><p>No tunnel is connected for this hostname.</p></body>\n</html>\n";

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub tunnel_bind: SocketAddr,
    pub http_bind: SocketAddr,
    /// Dot-prefixed domain appended to generated hostnames.
    pub hostname_suffix: String,
    /// HTML file served with 503 when no tunnel matches the Host header.
    pub error_page: PathBuf,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            tunnel_bind: ([0, 0, 0, 0], 9000).into(),
            http_bind: ([0, 0, 0, 0], 8080).into(),
            hostname_suffix: hostname::DEFAULT_SUFFIX.to_string(),
            error_page: PathBuf::from("static/error.html"),
        }
    }
}

pub struct IngressState {
    pub registry: TunnelRegistry,
    pub validator: TokenValidator,
    pub hostname_suffix: String,
    pub error_page: PathBuf,
}

impl IngressState {
    pub fn new(cfg: &IngressConfig, validator: TokenValidator) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            validator,
            hostname_suffix: cfg.hostname_suffix.clone(),
            error_page: cfg.error_page.clone(),
        }
    }
}

/// Runs both ingress listeners until interrupted.
pub async fn run_server(cfg: IngressConfig) -> Result<()> {
    let state = Arc::new(IngressState::new(&cfg, TokenValidator::from_env()));

    let tunnel_listener = TcpListener::bind(cfg.tunnel_bind)
        .await
        .with_context(|| format!("failed to bind tunnel listener on {}", cfg.tunnel_bind))?;
    let http_listener = TcpListener::bind(cfg.http_bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", cfg.http_bind))?;

    if config::dev_mode() {
        info!("HTTP ingress (dev mode) on {}", cfg.http_bind);
    } else {
        info!(
            "HTTP ingress on {} (TLS terminated by upstream reverse proxy)",
            cfg.http_bind
        );
    }

    tokio::select! {
        res = serve_tunnel(tunnel_listener, state.clone()) => res,
        res = serve_http(http_listener, state) => res,
        res = tokio::signal::ctrl_c() => {
            info!("shutting down ingress");
            res.map_err(Into::into)
        }
    }
}

/// Accept loop for agent transport connections; one task per agent.
pub async fn serve_tunnel(listener: TcpListener, state: Arc<IngressState>) -> Result<()> {
    info!(
        "listening for tunnel agents on {}",
        listener.local_addr().context("tunnel listener address")?
    );
    loop {
        let (conn, peer) = listener.accept().await.context("tunnel accept failed")?;
        let state = state.clone();
        tokio::spawn(handle_agent(conn, peer, state));
    }
}

/// Per-agent state machine: mux the transport, authenticate over the first
/// sub-stream, install into the registry, then park until the session dies.
async fn handle_agent(conn: TcpStream, peer: SocketAddr, state: Arc<IngressState>) {
    debug!("agent connection from {peer}");
    let (session, mut incoming) = MuxSession::server(conn);

    let hostname = match timeout(
        HANDSHAKE_TIMEOUT,
        authenticate(&mut incoming, &session, &state),
    )
    .await
    {
        Ok(Ok(hostname)) => hostname,
        Ok(Err(err)) => {
            warn!("agent {peer} rejected: {err:#}");
            session.close();
            return;
        }
        Err(_) => {
            warn!("agent {peer} handshake timed out");
            session.close();
            return;
        }
    };
    // Agents never open sub-streams after auth; any that arrive are dropped.
    drop(incoming);

    info!("agent for '{hostname}' connected from {peer}");
    session.closed().await;
    state.registry.remove(&hostname).await;
}

/// Runs the auth exchange on the agent's first sub-stream and reserves the
/// assigned hostname in the registry. On error the caller closes the session;
/// a reason frame has already been sent where the protocol calls for one.
async fn authenticate(
    incoming: &mut IncomingStreams,
    session: &MuxSession,
    state: &IngressState,
) -> Result<String> {
    let mut stream = incoming
        .next()
        .await
        .context("session closed before auth stream")?;
    let payload = read_frame(&mut stream)
        .await
        .context("failed to read auth frame")?;
    let request = AuthRequest::decode(&payload);

    if !state.validator.is_valid(&request.token).await {
        reject(&mut stream, "Invalid token").await;
        bail!("invalid token");
    }

    let assigned = if request.wants_auto() {
        match allocate_hostname(state, session, || hostname::generate(&state.hostname_suffix)).await
        {
            Some(assigned) => assigned,
            None => {
                reject(&mut stream, "No hostnames available").await;
                bail!("hostname space exhausted");
            }
        }
    } else {
        let requested = request.hostname;
        let entry = TunnelEntry::new(requested.clone(), session.clone());
        match state.registry.add(entry).await {
            Ok(()) => requested,
            Err(RegistryError::HostnameTaken(_)) => {
                reject(&mut stream, "Hostname is not available").await;
                bail!("requested hostname '{requested}' is taken");
            }
        }
    };

    let reply = AuthResponse::Ok(assigned.clone()).encode();
    if let Err(err) = write_frame(&mut stream, &reply).await {
        // Roll the reservation back; the agent never learned the name.
        state.registry.remove(&assigned).await;
        return Err(err).context("failed to write auth response");
    }
    let _ = stream.close().await;
    Ok(assigned)
}

/// Generates hostnames until one inserts cleanly, bounded so a full registry
/// terminates the handshake instead of looping forever.
async fn allocate_hostname<F>(
    state: &IngressState,
    session: &MuxSession,
    mut generate: F,
) -> Option<String>
where
    F: FnMut() -> String,
{
    for _ in 0..MAX_HOSTNAME_ATTEMPTS {
        let candidate = generate();
        let entry = TunnelEntry::new(candidate.clone(), session.clone());
        match state.registry.add(entry).await {
            Ok(()) => return Some(candidate),
            Err(RegistryError::HostnameTaken(_)) => continue,
        }
    }
    None
}

async fn reject(stream: &mut SubStream, reason: &str) {
    let frame = AuthResponse::Fail(reason.to_string()).encode();
    if let Err(err) = write_frame(stream, &frame).await {
        debug!("failed to send auth rejection: {err}");
    }
    let _ = stream.close().await;
}

/// Accept loop for inbound HTTP connections.
pub async fn serve_http(listener: TcpListener, state: Arc<IngressState>) -> Result<()> {
    info!(
        "HTTP ingress listening on {}",
        listener.local_addr().context("http listener address")?
    );
    loop {
        let (conn, peer) = listener.accept().await.context("http accept failed")?;
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http_request(state.clone(), peer, req));
            if let Err(err) = http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(conn), service)
                .await
            {
                debug!("http connection error from {peer}: {err}");
            }
        });
    }
}

/// Routes one inbound HTTP request over the matching tunnel.
async fn handle_http_request(
    state: Arc<IngressState>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(host_only)
        .filter(|host| !host.is_empty())
        .map(str::to_string);
    let Some(target_host) = host else {
        return Ok(plain_response(StatusCode::BAD_REQUEST, "Missing Host header"));
    };

    if !req.uri().path().contains(relay::NOISE_PATH_MARKER) {
        info!(
            "request: {} {} (host {target_host}, from {peer})",
            req.method(),
            req.uri().path()
        );
    }

    let Some(entry) = state.registry.get(&target_host).await else {
        return Ok(error_page_response(&state).await);
    };

    let mut stream = match entry.session.open_stream().await {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to open tunnel stream for '{target_host}': {err}");
            return Ok(plain_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel stream open failed",
            ));
        }
    };

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let mut headers = parts.headers;
    relay::append_forwarded_for(&mut headers, peer.ip());
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let frame = relay::encode_request(&parts.method, target, &headers, &body);

    match timeout(RELAY_WRITE_TIMEOUT, write_frame(&mut stream, &frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!("failed to write to tunnel stream for '{target_host}': {err}");
            return Ok(plain_response(StatusCode::BAD_GATEWAY, "Tunnel write failed"));
        }
        Err(_) => {
            error!("tunnel write deadline expired for '{target_host}'");
            return Ok(plain_response(StatusCode::BAD_GATEWAY, "Tunnel write failed"));
        }
    }

    let payload = match timeout(RELAY_READ_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(err)) => {
            error!("failed to read from tunnel stream for '{target_host}': {err}");
            return Ok(plain_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel response failed",
            ));
        }
        Err(_) => {
            error!("tunnel read deadline expired for '{target_host}'");
            return Ok(plain_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel response failed",
            ));
        }
    };
    let _ = stream.close().await;

    let relayed = match relay::decode_response(&payload) {
        Ok(relayed) => relayed,
        Err(err) => {
            error!("malformed tunnel response for '{target_host}': {err}");
            return Ok(plain_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel response failed",
            ));
        }
    };

    let mut builder = Response::builder().status(relayed.status);
    for (name, value) in &relayed.headers {
        // hyper recomputes framing headers for the exact-length body.
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    Ok(builder.body(full_body(relayed.body)).unwrap())
}

/// Host header minus any `:port` suffix.
fn host_only(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

async fn error_page_response(state: &IngressState) -> Response<BoxBody> {
    let body = match tokio::fs::read(&state.error_page).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => Bytes::from_static(FALLBACK_ERROR_PAGE.as_bytes()),
    };
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body))
        .unwrap()
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap()
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_strips_port() {
        assert_eq!(host_only("red-fox-1.n.sbn.lol:8080"), "red-fox-1.n.sbn.lol");
        assert_eq!(host_only("red-fox-1.n.sbn.lol"), "red-fox-1.n.sbn.lol");
        assert_eq!(host_only(""), "");
    }

    #[tokio::test]
    async fn hostname_allocation_terminates_when_names_are_exhausted() {
        let cfg = IngressConfig {
            hostname_suffix: ".test.example".into(),
            ..IngressConfig::default()
        };
        let state = IngressState::new(&cfg, TokenValidator::new(None, Duration::from_secs(1)));
        let (a, _b) = tokio::io::duplex(4096);
        let (session, _incoming) = MuxSession::server(a);

        state
            .registry
            .add(TunnelEntry::new("stuck.test.example", session.clone()))
            .await
            .unwrap();

        // Every candidate collides; the loop must give up, not spin.
        let assigned =
            allocate_hostname(&state, &session, || "stuck.test.example".to_string()).await;
        assert!(assigned.is_none());
    }
}
