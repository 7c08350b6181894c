//! Request head rewriting for the outbound leg.
//!
//! `:scheme` and `:authority` come from the route decision. Every other
//! header and metadata entry is copied verbatim and in order, minus `host`
//! and the connection-specific headers HTTP/2 forbids.

use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use http::request::Parts;
use http::{HeaderMap, Request, Uri, Version};

use crate::routing::director::{RouteDecision, RoutingError};

const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";

fn is_connection_specific(name: &HeaderName) -> bool {
    *name == CONNECTION
        || *name == TRANSFER_ENCODING
        || *name == UPGRADE
        || name.as_str() == KEEP_ALIVE
        || name.as_str() == PROXY_CONNECTION
}

/// Move end-to-end headers from `src` into `dst`, keeping their order.
///
/// `HeaderMap` iterates names in first-insertion order with all values of
/// one name together, so repeated keys keep their relative order.
pub fn copy_end_to_end(src: HeaderMap, dst: &mut HeaderMap) {
    dst.reserve(src.len());
    let mut current: Option<HeaderName> = None;
    for (name, value) in src {
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        if *name == HOST || is_connection_specific(name) {
            continue;
        }
        dst.append(name.clone(), value);
    }
}

/// Build the outbound request head for a routed stream.
pub fn rewrite_request(head: Parts, decision: &RouteDecision) -> Result<Request<()>, RoutingError> {
    let path_and_query = head
        .uri
        .path_and_query()
        .cloned()
        .ok_or(RoutingError::MissingPath)?;

    let uri = Uri::builder()
        .scheme(decision.backend.scheme.uri_scheme())
        .authority(decision.backend.authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| RoutingError::Rewrite(e.to_string()))?;

    let mut request = Request::new(());
    *request.method_mut() = head.method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_2;
    copy_end_to_end(head.headers, request.headers_mut());
    Ok(request)
}
