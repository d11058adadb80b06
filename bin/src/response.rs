//! Transfer results.

use std::{
    borrow::Cow,
    collections::HashMap,
    fs::File,
    io::{self, Write},
    path::Path,
    time::Duration,
};

/// Why a transfer failed.
///
/// Codes are stable and `0` is reserved for "no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Could not connect to the host or proxy.
    ConnectionFailure,
    /// The server closed the connection without answering.
    EmptyResponse,
    /// DNS lookup failed.
    HostResolutionFailure,
    /// Failure inside the client itself.
    InternalError,
    /// The URL could not be parsed.
    InvalidUrlFormat,
    /// Reading the response failed.
    NetworkReceiveError,
    /// Sending the request failed.
    NetworkSendFailure,
    /// A timeout elapsed.
    OperationTimedOut,
    /// The proxy could not be used.
    ProxyResolutionFailure,
    /// TLS handshake failed.
    SslConnectError,
    /// The configured CA certificate could not be loaded.
    SslCaCertError,
    /// The URL scheme is not supported by the transport.
    UnsupportedProtocol,
    /// The transfer was cancelled.
    RequestCancelled,
    /// The redirect limit was hit.
    TooManyRedirects,
    /// The upload source could not be read.
    FileReadError,
    /// The download destination could not be written.
    FileWriteError,
    /// Anything else.
    UnknownError,
}

impl ErrorCode {
    /// Stable numeric code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::ConnectionFailure => 1,
            Self::EmptyResponse => 2,
            Self::HostResolutionFailure => 3,
            Self::InternalError => 4,
            Self::InvalidUrlFormat => 5,
            Self::NetworkReceiveError => 6,
            Self::NetworkSendFailure => 7,
            Self::OperationTimedOut => 8,
            Self::ProxyResolutionFailure => 9,
            Self::SslConnectError => 10,
            Self::SslCaCertError => 13,
            Self::UnsupportedProtocol => 15,
            Self::RequestCancelled => 16,
            Self::TooManyRedirects => 17,
            Self::FileReadError => 18,
            Self::FileWriteError => 19,
            Self::UnknownError => 1000,
        }
    }
}

/// A failed transfer, as delivered in [`Response::error`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[error("{code:?} ({}): {message}", .code.code())]
pub struct TransferError {
    /// Failure class.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
}

impl TransferError {
    /// Creates an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error reported when a cancellation stopped the transfer.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::RequestCancelled, "Request cancelled")
    }
}

/// Result of a transfer. Written once, by the completion of its request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// HTTP status, `0` when no response was received.
    pub status_code: u16,
    /// Reason phrase of the status.
    pub reason: String,
    /// Response body. Empty for downloads, which go to the file.
    pub body: Vec<u8>,
    /// Effective URL after redirects.
    pub url: String,
    /// Response headers keyed by lower-case name.
    pub headers: HashMap<String, String>,
    /// Cookies set by the response.
    pub cookies: HashMap<String, String>,
    /// Time spent on the transfer.
    pub elapsed: Duration,
    /// Set when the transfer failed.
    pub error: Option<TransferError>,
    /// Bytes sent in the request body.
    pub uploaded_bytes: u64,
    /// Bytes received in the response body.
    pub downloaded_bytes: u64,
    /// Redirects followed.
    pub redirect_count: u32,
}

impl Response {
    /// A response carrying only an error.
    #[must_use]
    pub fn from_error(url: &str, error: TransferError) -> Self {
        Self {
            url: url.to_string(),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Body as text, invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Header value, case-insensitive.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Cookie value by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Error code, if the transfer failed.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|error| error.code)
    }

    /// Error message, empty on success.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map_or("", |error| error.message.as_str())
    }

    /// Whether the transfer was stopped by a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.error_code() == Some(ErrorCode::RequestCancelled)
    }

    /// Writes the body to `path` and returns the number of bytes written.
    /// Nothing is written for an empty body.
    ///
    /// # Errors
    /// - `io::Error` when the file cannot be created or written
    pub fn save_body_to_file(&self, path: impl AsRef<Path>) -> io::Result<usize> {
        if self.body.is_empty() {
            return Ok(0);
        }
        let mut file = File::create(path)?;
        file.write_all(&self.body)?;
        Ok(self.body.len())
    }
}
