//! HTTP/1.1 wire codec for relayed requests and responses.
//!
//! One framed payload carries one complete message: request line (or status
//! line), header section, CRLF, body. Hop-by-hop headers are stripped at
//! encode time and `Content-Length` is recomputed from the framed body, so
//! the receiving side can treat the frame remainder as the entire body.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;

const MAX_HEADERS: usize = 64;

/// Header carrying the original caller's IP across the tunnel.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Dev-tooling hot-reload chatter, kept out of request logs on both sides.
pub const NOISE_PATH_MARKER: &str = "/_next/webpack-hmr";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed http message: {0}")]
    Parse(#[from] httparse::Error),

    /// The frame ended before the header section did.
    #[error("truncated http message")]
    Incomplete,

    #[error("invalid http message: {0}")]
    Invalid(&'static str),
}

/// An HTTP request as carried over a tunnel sub-stream (ingress → agent).
#[derive(Debug)]
pub struct RelayedRequest {
    pub method: Method,
    /// Origin-form request target (`/path?query`).
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An HTTP response as carried over a tunnel sub-stream (agent → ingress).
#[derive(Debug)]
pub struct RelayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    use http::header;
    *name == header::CONNECTION
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::PROXY_AUTHENTICATE
        || *name == header::PROXY_AUTHORIZATION
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Writes the end-to-end headers, leaving `Content-Length` to the caller.
fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == http::header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> HeaderMap {
    HeaderMap::from_iter(raw.iter().flat_map(|h| {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

/// Serializes a full HTTP request into one frame payload.
pub fn encode_request(method: &Method, target: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
    write_headers(&mut out, headers);
    if !body.is_empty() {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

pub fn decode_request(payload: &[u8]) -> Result<RelayedRequest, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(payload)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(RelayError::Incomplete),
    };
    let method = Method::from_bytes(req.method.ok_or(RelayError::Invalid("missing method"))?.as_bytes())
        .map_err(|_| RelayError::Invalid("bad method"))?;
    let target = req
        .path
        .ok_or(RelayError::Invalid("missing request target"))?
        .to_string();
    Ok(RelayedRequest {
        method,
        target,
        headers: collect_headers(req.headers),
        body: Bytes::copy_from_slice(&payload[header_len..]),
    })
}

/// Serializes a full HTTP response into one frame payload. `Content-Length`
/// is always emitted so the ingress can rebuild an exact-length body.
pub fn encode_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    write_headers(&mut out, headers);
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_response(payload: &[u8]) -> Result<RelayedResponse, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let header_len = match res.parse(payload)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(RelayError::Incomplete),
    };
    let status = StatusCode::from_u16(res.code.ok_or(RelayError::Invalid("missing status"))?)
        .map_err(|_| RelayError::Invalid("bad status code"))?;
    Ok(RelayedResponse {
        status,
        headers: collect_headers(res.headers),
        body: Bytes::copy_from_slice(&payload[header_len..]),
    })
}

/// Appends `addr` to the `X-Forwarded-For` chain.
pub fn append_forwarded_for(headers: &mut HeaderMap, addr: std::net::IpAddr) {
    let name = HeaderName::from_static(X_FORWARDED_FOR);
    let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {addr}"),
        _ => addr.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, CONTENT_TYPE, HOST, TRANSFER_ENCODING};

    #[test]
    fn request_round_trips_method_target_headers_body() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "red-fox-1.n.sbn.lol".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        let payload = encode_request(&Method::POST, "/api/items?id=7", &headers, b"{\"a\":1}");

        let decoded = decode_request(&payload).unwrap();
        assert_eq!(decoded.method, Method::POST);
        assert_eq!(decoded.target, "/api/items?id=7");
        assert_eq!(decoded.headers.get(HOST).unwrap(), "red-fox-1.n.sbn.lol");
        assert_eq!(decoded.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(decoded.body.as_ref(), b"{\"a\":1}");
    }

    #[test]
    fn request_encoding_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "h.example".parse().unwrap());
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        let payload = encode_request(&Method::GET, "/", &headers, b"");

        let decoded = decode_request(&payload).unwrap();
        assert!(decoded.headers.get(CONNECTION).is_none());
        assert!(decoded.headers.get(TRANSFER_ENCODING).is_none());
        assert!(decoded.headers.get(HOST).is_some());
    }

    #[test]
    fn response_round_trips_and_recomputes_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.insert(http::header::CONTENT_LENGTH, "999".parse().unwrap());
        let payload = encode_response(StatusCode::OK, &headers, b"hello");

        let decoded = decode_response(&payload).unwrap();
        assert_eq!(decoded.status, StatusCode::OK);
        assert_eq!(decoded.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(
            decoded.headers.get(http::header::CONTENT_LENGTH).unwrap(),
            "5"
        );
        assert_eq!(decoded.body.as_ref(), b"hello");
    }

    #[test]
    fn response_with_empty_body_still_carries_length() {
        let payload = encode_response(StatusCode::NO_CONTENT, &HeaderMap::new(), b"");
        let decoded = decode_response(&payload).unwrap();
        assert_eq!(decoded.status, StatusCode::NO_CONTENT);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn truncated_header_section_is_incomplete() {
        let err = decode_request(b"GET / HTTP/1.1\r\nHost: h").unwrap_err();
        assert!(matches!(err, RelayError::Incomplete));
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!(decode_response(b"\x00\x01\x02not http").is_err());
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.9".parse().unwrap());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.9");
        append_forwarded_for(&mut headers, "192.168.1.4".parse().unwrap());
        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.9, 192.168.1.4"
        );
    }
}
