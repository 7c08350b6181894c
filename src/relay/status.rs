//! gRPC status codes and synthesized terminal responses.
//!
//! When the proxy itself has to end a stream (routing failure, backend
//! unreachable or lost) the caller still receives a standard gRPC status:
//! as trailers when response headers already went out, otherwise as a
//! trailers-only response.

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Response, StatusCode};

pub const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
pub const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn header_value(self) -> HeaderValue {
        HeaderValue::from(u16::from(self.as_u8()))
    }
}

/// Percent-encode a status message as gRPC requires for `grpc-message`.
///
/// Printable ASCII other than `%` passes through; everything else is
/// `%XX`-encoded byte by byte.
pub fn encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// `grpc-status` (and `grpc-message`) trailers.
pub fn status_trailers(code: Code, message: &str) -> HeaderMap {
    let mut trailers = HeaderMap::with_capacity(2);
    trailers.insert(GRPC_STATUS, code.header_value());
    if !message.is_empty() {
        // Encoded output is visible ASCII, always a valid header value.
        if let Ok(value) = HeaderValue::from_str(&encode_message(message)) {
            trailers.insert(GRPC_MESSAGE, value);
        }
    }
    trailers
}

/// A complete trailers-only response: HTTP 200 whose only HEADERS frame
/// carries the gRPC status and ends the stream.
pub fn trailers_only(code: Code, message: &str) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.extend(status_trailers(code, message));
    response
}
