//! Reference measurement backend
//!
//! The endpoints `HttpTransport` talks to with its default settings:
//! `/garbage` streams incompressible data, `/empty` answers pings and
//! swallows uploads, `/getIP` reports the caller's address.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use surge_core::measurement::random_payload;

const MIB: usize = 1024 * 1024;

/// Upper bound on `ckSize`.
pub const MAX_GARBAGE_CHUNKS: u64 = 1024;

const DEFAULT_GARBAGE_CHUNKS: u64 = 4;

/// Query of the download endpoint.
#[derive(Debug, Deserialize)]
pub struct GarbageQuery {
    /// Number of 1 MiB chunks to send
    #[serde(rename = "ckSize")]
    pub chunks: Option<u64>,
}

fn no_store(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Streams `ckSize` MiB of random data, one shared random block repeated.
pub async fn garbage(Query(query): Query<GarbageQuery>) -> Response {
    let chunks = query
        .chunks
        .unwrap_or(DEFAULT_GARBAGE_CHUNKS)
        .clamp(1, MAX_GARBAGE_CHUNKS);
    let block = random_payload(MIB);
    tracing::debug!("Serving {} MiB of garbage", chunks);

    let stream =
        futures::stream::iter(0..chunks).map(move |_| Ok::<_, Infallible>(block.clone()));
    let mut response = Body::from_stream(stream).into_response();

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=random.dat"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(chunks * MIB as u64));
    no_store(headers);
    response
}

/// Answers immediately with an empty body; uploaded bodies are drained and
/// discarded.
pub async fn empty(request: Request) -> Response {
    let mut body = request.into_body().into_data_stream();
    let mut received = 0usize;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => received += bytes.len(),
            Err(e) => {
                tracing::debug!("Upload body aborted after {} bytes: {}", received, e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }
    tracing::trace!("Empty endpoint drained {} bytes", received);

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    no_store(headers);
    response
}

/// Caller's address as `{processedString, rawIspInfo}`.
///
/// Forwarding headers win over the socket address so the endpoint works
/// behind a reverse proxy.
pub async fn get_ip(request: Request) -> Response {
    let address = forwarded_address(request.headers()).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(peer)| peer.ip())
    });

    let Some(address) = address else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "client address unavailable" })),
        )
            .into_response();
    };

    let mut response = Json(json!({
        "processedString": describe_address(address),
        "rawIspInfo": "",
    }))
    .into_response();
    no_store(response.headers_mut());
    response
}

fn forwarded_address(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok());

    forwarded
        .into_iter()
        .chain(real_ip)
        .find_map(|raw| raw.trim().parse().ok())
}

fn describe_address(address: IpAddr) -> String {
    let address = match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(address, IpAddr::V4),
        v4 => v4,
    };
    let note = match address {
        IpAddr::V4(v4) if v4.is_loopback() => Some("localhost IPv4 access"),
        IpAddr::V4(v4) if v4.is_private() => Some("private IPv4 access"),
        IpAddr::V4(v4) if v4.is_link_local() => Some("link-local IPv4 access"),
        IpAddr::V6(v6) if v6.is_loopback() => Some("localhost IPv6 access"),
        IpAddr::V6(v6) if v6.is_unique_local() => Some("ULA IPv6 access"),
        IpAddr::V6(v6) if v6.is_unicast_link_local() => Some("link-local IPv6 access"),
        _ => None,
    };
    match note {
        Some(note) => format!("{address} - {note}"),
        None => address.to_string(),
    }
}
