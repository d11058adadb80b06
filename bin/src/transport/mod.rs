//! Transport abstraction: the library that actually speaks the wire protocol.
//!
//! The engine only needs to create sessions, hand a [`Transfer`] to a session and get
//! a [`Response`] back. Sessions are long-lived and reused across transfers to the
//! same host by the session cache.

pub mod reqwest;

use std::{
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use crate::{
    control::{RequestProgress, TransferFlow},
    options::{RequestMethod, RequestOptions},
    response::Response,
};

/// Progress hook installed on every transfer.
///
/// Called by the transport whenever bytes move, and periodically while it waits on
/// the network. Returning [`TransferFlow::Abort`] stops the transfer.
pub type ProgressHook = Arc<dyn Fn(RequestProgress) -> TransferFlow + Send + Sync>;

/// File side of an upload or download.
pub enum FileTransfer {
    /// Stream the request body from `reader`.
    Upload {
        /// Source of the body.
        reader: Box<dyn Read + Send>,
        /// Number of bytes `reader` yields.
        len: u64,
    },
    /// Stream the response body into `writer`.
    Download {
        /// Destination of the body.
        writer: Box<dyn Write + Send>,
    },
}

impl fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload { len, .. } => f.debug_struct("Upload").field("len", len).finish(),
            Self::Download { .. } => f.write_str("Download"),
        }
    }
}

/// One transfer to perform on a session.
pub struct Transfer {
    /// Request method.
    pub method: RequestMethod,
    /// Target URL.
    pub url: String,
    /// Options to apply. Each field is optional and applied independently.
    pub options: Arc<RequestOptions>,
    /// Progress hook.
    pub progress: ProgressHook,
    /// File side of upload and download methods.
    pub file: Option<FileTransfer>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

/// A reusable transport connection handle.
pub trait Session: Send + 'static {
    /// Runs the transfer to completion.
    ///
    /// Failures never escape as errors: they are reported in [`Response::error`].
    fn perform(&mut self, transfer: Transfer) -> Response;
}

/// Session factory.
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by this transport.
    type Session: Session;

    /// Creates a fresh session with no warm connections.
    fn create_session(&self) -> Self::Session;
}
