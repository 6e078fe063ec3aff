use std::fmt;

/// Errors surfaced by the federation core.
///
/// Everything raised before the response is prepared maps to an FDSN error
/// document via `http_status` / `fdsn_body`. Errors raised after preparation
/// are logged and terminate the stream.
#[derive(Debug)]
pub enum FederatorError {
    /// Malformed selection parameters or request body.
    Validation(String),
    /// No route matched, or no endpoint produced any byte.
    NoData,
    /// A resolved duration ceiling was exceeded, or an endpoint replied 413.
    PayloadTooLarge(String),
    /// The routing service is unreachable or replied with a server error.
    RoutingUnavailable(String),
    /// Every endpoint of the selection is unavailable.
    UpstreamUnavailable,
    Internal(String),
    Cancelled,
}

impl fmt::Display for FederatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FederatorError::Validation(msg) => write!(f, "validation error: {}", msg),
            FederatorError::NoData => write!(f, "no data available"),
            FederatorError::PayloadTooLarge(msg) => write!(f, "payload too large: {}", msg),
            FederatorError::RoutingUnavailable(msg) => write!(f, "Error while routing: {}", msg),
            FederatorError::UpstreamUnavailable => write!(f, "no upstream endpoint available"),
            FederatorError::Internal(msg) => write!(f, "internal error: {}", msg),
            FederatorError::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for FederatorError {}

impl FederatorError {
    /// HTTP status for errors raised before the response is prepared.
    /// `nodata` is the client-elected empty-result code (204 or 404).
    pub fn http_status(&self, nodata: u16) -> u16 {
        match self {
            FederatorError::Validation(_) => 400,
            FederatorError::NoData => nodata,
            FederatorError::PayloadTooLarge(_) => 413,
            FederatorError::RoutingUnavailable(_) => 500,
            FederatorError::UpstreamUnavailable => 503,
            FederatorError::Internal(_) => 500,
            FederatorError::Cancelled => 500,
        }
    }

    /// Render the FDSN plain-text error document. 204 responses carry no
    /// body; every other error status gets the `Error <code>: <title>` report.
    pub fn fdsn_body(&self, status: u16, request_line: &str, submitted: &str) -> String {
        let title = match status {
            400 => "Bad Request",
            404 => "Not Found",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Error",
        };
        format!(
            "Error {}: {}\n\n{}\n\nRequest:\n{}\n\nRequest Submitted:\n{}\n\nService version:\n{}\n",
            status,
            title,
            self,
            request_line,
            submitted,
            env!("CARGO_PKG_VERSION"),
        )
    }
}
