//! Mapping of dispatch outcomes to HTTP responses

use crate::executor::{ExecError, ExecutionResult};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header carrying the gateway error code on failure responses
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";
/// Header correlating a response with the server-side log entries
pub const X_REQUEST_ID: &str = "x-request-id";

/// Error codes for dispatch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No route registered for this (method, path)
    RouteNotFound,
    /// Request header metadata could not be encoded
    MetadataRejected,
    /// The route executable could not be spawned
    SpawnFailed,
    /// The execution exceeded its timeout and was terminated
    ExecTimeout,
    /// The executable exited with a non-zero code
    NonZeroExit,
    /// Too many executions in flight
    Overloaded,
    /// Internal gateway error
    Internal,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MetadataRejected => StatusCode::BAD_REQUEST,
            GatewayErrorCode::SpawnFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ExecTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::NonZeroExit => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::MetadataRejected => "METADATA_REJECTED",
            GatewayErrorCode::SpawnFailed => "SPAWN_FAILED",
            GatewayErrorCode::ExecTimeout => "EXEC_TIMEOUT",
            GatewayErrorCode::NonZeroExit => "NON_ZERO_EXIT",
            GatewayErrorCode::Overloaded => "OVERLOADED",
            GatewayErrorCode::Internal => "INTERNAL",
        }
    }

    /// Generic client-visible body for this error. Deliberately says
    /// nothing about executables, paths, or captured output; the request
    /// id header is the handle into the server logs.
    pub fn generic_message(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "not found\n",
            GatewayErrorCode::MetadataRejected => "request metadata rejected\n",
            GatewayErrorCode::SpawnFailed => "upstream command unavailable\n",
            GatewayErrorCode::ExecTimeout => "upstream command timed out\n",
            GatewayErrorCode::NonZeroExit => "upstream command failed\n",
            GatewayErrorCode::Overloaded => "server busy, retry later\n",
            GatewayErrorCode::Internal => "internal error\n",
        }
    }
}

impl From<&ExecError> for GatewayErrorCode {
    fn from(error: &ExecError) -> Self {
        match error {
            ExecError::Overloaded(_) => GatewayErrorCode::Overloaded,
            ExecError::Spawn(_) => GatewayErrorCode::SpawnFailed,
            ExecError::Timeout(_) => GatewayErrorCode::ExecTimeout,
            ExecError::Io(_) => GatewayErrorCode::Internal,
        }
    }
}

/// Build a plain-text failure response with the generic body for the code
pub fn error_response(
    code: GatewayErrorCode,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response_with_body(code, request_id, Bytes::from_static(code.generic_message().as_bytes()))
}

/// Build a plain-text failure response with an explicit body
pub fn error_response_with_body(
    code: GatewayErrorCode,
    request_id: &str,
    body: Bytes,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain")
        .header(X_GATEWAY_ERROR, code.as_header_value());

    // Request ids are generated as UUIDs and always valid header values;
    // skip the header rather than fail the response if one is not
    if let Ok(value) = hyper::header::HeaderValue::from_str(request_id) {
        builder = builder.header(X_REQUEST_ID, value);
    }

    builder
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Build a 200 response whose body is the captured stdout, byte for byte
pub fn success_response(
    body: Vec<u8>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain");

    if let Ok(value) = hyper::header::HeaderValue::from_str(request_id) {
        builder = builder.header(X_REQUEST_ID, value);
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Turn an execution outcome into the client-visible response.
///
/// Classification is exit-code based only: exit 0 is success no matter what
/// the process wrote to stderr. On failure the body is generic unless
/// `expose_stderr` is set, in which case the captured stderr is passed
/// through (empty stderr still falls back to the generic message).
pub fn from_execution(
    outcome: Result<ExecutionResult, ExecError>,
    expose_stderr: bool,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match outcome {
        Ok(result) if result.success() => success_response(result.stdout_body(), request_id),
        Ok(result) => {
            let stderr = result.stderr_body();
            if expose_stderr && !stderr.is_empty() {
                error_response_with_body(
                    GatewayErrorCode::NonZeroExit,
                    request_id,
                    Bytes::from(stderr),
                )
            } else {
                error_response(GatewayErrorCode::NonZeroExit, request_id)
            }
        }
        Err(ref error) => error_response(GatewayErrorCode::from(error), request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        // wait(2) encodes a normal exit in the high byte
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    fn result_with(code: i32, stdout: &[u8], stderr: &[u8]) -> ExecutionResult {
        ExecutionResult {
            status: exit_status(code),
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::RouteNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayErrorCode::MetadataRejected.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayErrorCode::SpawnFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayErrorCode::ExecTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayErrorCode::NonZeroExit.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayErrorCode::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            GatewayErrorCode::RouteNotFound.as_header_value(),
            "ROUTE_NOT_FOUND"
        );
        assert_eq!(
            GatewayErrorCode::ExecTimeout.as_header_value(),
            "EXEC_TIMEOUT"
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(GatewayErrorCode::Overloaded, "req-1");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
        assert_eq!(response.headers().get(X_GATEWAY_ERROR).unwrap(), "OVERLOADED");
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_zero_maps_to_ok() {
        let response = from_execution(Ok(result_with(0, b"ok\n", b"")), false, "req-1");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_GATEWAY_ERROR).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_zero_with_stderr_is_still_ok() {
        // Exit code is authoritative; stderr content never reclassifies
        let response = from_execution(Ok(result_with(0, b"ok\n", b"warning: x")), false, "req-1");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_maps_to_bad_gateway() {
        let response = from_execution(Ok(result_with(2, b"", b"boom")), false, "req-1");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "NON_ZERO_EXIT"
        );
    }

    #[test]
    fn test_spawn_failure_maps_to_bad_gateway() {
        let outcome = Err(ExecError::Spawn(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )));
        let response = from_execution(outcome, false, "req-1");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "SPAWN_FAILED"
        );
    }

    #[test]
    fn test_timeout_maps_to_gateway_timeout() {
        let outcome = Err(ExecError::Timeout(Duration::from_secs(30)));
        let response = from_execution(outcome, false, "req-1");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_overload_maps_to_service_unavailable() {
        let outcome = Err(ExecError::Overloaded(Duration::from_secs(5)));
        let response = from_execution(outcome, false, "req-1");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
