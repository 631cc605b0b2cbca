//! Trace records and the pure functions that assemble them.
//!
//! Field names serialize in camelCase to match what Metlo collectors accept.

use crate::capture::CaptureBuffer;
use crate::config::MetloConfig;
use crate::error::TraceError;
use axum::extract::ConnectInfo;
use http::header::{HOST, HeaderMap};
use http::request::Parts;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::warn;

/// Tag identifying this integration in `meta.metloSource`.
pub const METLO_SOURCE: &str = "rust/tower";

/// One flattened header or query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceUrl {
    pub host: String,
    pub path: String,
    pub parameters: Vec<NameValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceReq {
    pub url: TraceUrl,
    pub headers: Vec<NameValue>,
    pub body: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRes {
    pub status: u16,
    pub body: String,
    pub headers: Vec<NameValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMeta {
    pub environment: String,
    pub incoming: bool,
    pub source: String,
    pub source_port: u16,
    pub destination: String,
    pub destination_port: u16,
    pub metlo_source: String,
}

/// A complete request/response exchange, as handed to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetloTrace {
    pub request: TraceReq,
    pub response: TraceRes,
    pub meta: TraceMeta,
}

/// Build the request half of a trace from the request head and its full body.
pub fn request_trace(parts: &Parts, body: &[u8], user: Option<String>) -> TraceReq {
    TraceReq {
        url: TraceUrl {
            host: request_host(parts),
            path: parts.uri.path().to_string(),
            parameters: flatten_query(parts.uri.query().unwrap_or_default()),
        },
        headers: flatten_headers(&parts.headers),
        body: String::from_utf8_lossy(body).into_owned(),
        method: parts.method.as_str().to_string(),
        user,
    }
}

/// Build the response half of a trace once the response body has been seen.
pub fn response_trace(status: StatusCode, headers: &HeaderMap, captured: CaptureBuffer) -> TraceRes {
    TraceRes {
        status: status.as_u16(),
        body: captured.into_string(),
        headers: flatten_headers(headers),
    }
}

/// Build trace metadata for an inbound request.
///
/// A missing or malformed remote address degrades to port 0 and logs a
/// warning; it never fails.
pub fn trace_meta(parts: &Parts, config: &MetloConfig) -> TraceMeta {
    let remote = remote_addr(parts);

    let (remote_host, source_port) = match remote
        .as_deref()
        .ok_or(TraceError::MissingRemoteAddr)
        .and_then(split_host_port)
    {
        Ok(split) => split,
        Err(e) => {
            warn!(error = %e, "Couldn't find source port for incoming request");
            (String::new(), 0)
        }
    };

    TraceMeta {
        environment: config.environment.clone(),
        incoming: true,
        source: client_ip(&parts.headers).unwrap_or(remote_host),
        source_port,
        destination: config.server_host.clone(),
        destination_port: config.server_port,
        metlo_source: METLO_SOURCE.to_string(),
    }
}

/// Flatten a header map into one entry per name, multiple values joined by
/// commas in the order they were received.
///
/// Names are reported in canonical form (`content-type` becomes
/// `Content-Type`).
pub fn flatten_headers(headers: &HeaderMap) -> Vec<NameValue> {
    headers
        .keys()
        .map(|name| {
            let value = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()))
                .collect::<Vec<_>>()
                .join(",");
            NameValue::new(canonical_header_name(name.as_str()), value)
        })
        .collect()
}

/// Flatten a URL query string, grouping repeated keys by first appearance.
pub fn flatten_query(query: &str) -> Vec<NameValue> {
    let mut params: Vec<NameValue> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match params.iter_mut().find(|p| p.name == key) {
            Some(existing) => {
                existing.value.push(',');
                existing.value.push_str(&value);
            }
            None => params.push(NameValue::new(key, value)),
        }
    }
    params
}

/// Canonical MIME header form: first letter and each letter after a hyphen
/// upper-cased, the rest lower-cased.
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Split `host:port` (IPv6 hosts in brackets) into its parts.
pub fn split_host_port(addr: &str) -> Result<(String, u16), TraceError> {
    let invalid = |reason| TraceError::InvalidRemoteAddr {
        addr: addr.to_string(),
        reason,
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;

    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| invalid("missing ']'"))?,
        None if host.contains(':') => return Err(invalid("too many colons")),
        None => host,
    };

    let port = port.parse::<u16>().map_err(|source| TraceError::InvalidPort {
        addr: addr.to_string(),
        source,
    })?;

    Ok((host.to_string(), port))
}

/// The peer address recorded by the server, if any.
fn remote_addr(parts: &Parts) -> Option<String> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
}

/// Client address as reported by forwarding proxies.
///
/// The first `X-Forwarded-For` entry wins, then `X-Real-Ip`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded.or_else(real_ip).map(str::to_string)
}

fn request_host(parts: &Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}
