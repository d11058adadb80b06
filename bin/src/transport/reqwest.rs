//! Transport over the `reqwest` client.
//!
//! A session owns one [`Client`], which keeps the warm connections to the hosts it
//! talked to, and the single-threaded runtime that drives it. Client-level settings
//! (proxy, connect timeout, TLS requirement) are a [`ClientProfile`], and the client
//! is only rebuilt when a transfer needs a different profile than the previous one.
//!
//! The progress hook runs after every body chunk and on a fixed interval while the
//! transfer waits on the network, so an abort is seen within one interval even when
//! the server never answers.

use std::{
    fmt::Write as _,
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use ::reqwest::{
    header::{CONTENT_LENGTH, COOKIE, SET_COOKIE, USER_AGENT},
    redirect, Body, Certificate, Client, Method, Proxy, RequestBuilder,
};
use tokio::{
    runtime::{self, Runtime},
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tokio_stream::wrappers::ReceiverStream;

use super::{FileTransfer, ProgressHook, Session, Transfer, Transport};
use crate::{
    control::{RequestProgress, TransferFlow},
    options::{Credentials, RequestMethod, RequestOptions},
    response::{ErrorCode, Response, TransferError},
};

/// Redirects followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Largest chunk read from an upload source at once.
const READ_CHUNK: usize = 16 * 1024;

/// Upload chunks buffered between the reading thread and the connection.
const UPLOAD_QUEUE: usize = 4;

/// How often the progress hook runs while the transfer waits on the network.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Why an upload stopped early, read back when the send fails.
type FailureSlot = Arc<Mutex<Option<TransferError>>>;

/// Transport-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ReqwestConfig {
    /// Extra PEM root certificate trusted by every session.
    pub ca_cert_path: Option<PathBuf>,
}

/// Creates [`ReqwestSession`]s.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    /// Shared settings.
    config: Arc<ReqwestConfig>,
}

impl ReqwestTransport {
    /// Creates a transport.
    #[must_use]
    pub fn new(config: ReqwestConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Transport for ReqwestTransport {
    type Session = ReqwestSession;

    fn create_session(&self) -> ReqwestSession {
        ReqwestSession {
            config: self.config.clone(),
            client: None,
            runtime: None,
            redirects: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// Settings baked into a [`Client`] when it is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ClientProfile {
    /// Proxy URL.
    proxy_url: Option<String>,
    /// Proxy credentials.
    proxy_auth: Option<Credentials>,
    /// Connection phase timeout.
    connect_timeout: Option<Duration>,
    /// Refuse plain-text URLs, redirects included.
    https_only: bool,
}

impl ClientProfile {
    /// Profile a transfer with these options needs.
    fn of(options: &RequestOptions) -> Self {
        Self {
            proxy_url: options.proxy_url.clone(),
            proxy_auth: options.proxy_auth.clone(),
            connect_timeout: options.connect_timeout,
            https_only: options.require_secure,
        }
    }
}

/// One `reqwest` client, the profile it was built with and the runtime driving it.
pub struct ReqwestSession {
    /// Shared settings.
    config: Arc<ReqwestConfig>,
    /// Client of the last transfer. Dropped before the runtime.
    client: Option<(ClientProfile, Client)>,
    /// Current-thread runtime, started by the first transfer.
    runtime: Option<Runtime>,
    /// Redirects seen by the current transfer, written by the redirect policy.
    redirects: Arc<AtomicU32>,
}

impl std::fmt::Debug for ReqwestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestSession")
            .field("profile", &self.client.as_ref().map(|(profile, _)| profile))
            .finish_non_exhaustive()
    }
}

impl Session for ReqwestSession {
    fn perform(&mut self, transfer: Transfer) -> Response {
        let started = Instant::now();
        let url = transfer.url.clone();

        let mut response = match self.execute(transfer) {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(%url, %error, "transfer failed");
                Response::from_error(&url, error)
            },
        };
        response.elapsed = started.elapsed();
        response.redirect_count = self.redirects.load(Ordering::Relaxed);
        response
    }
}

impl ReqwestSession {
    /// Runs the transfer, any failure becomes the response error.
    fn execute(&mut self, transfer: Transfer) -> Result<Response, TransferError> {
        let Transfer {
            method,
            url,
            options,
            progress,
            file,
        } = transfer;

        check_url(&url, &options)?;
        self.redirects.store(0, Ordering::Relaxed);
        let client = self.client_for(ClientProfile::of(&options))?.clone();

        let (upload, download) = match file {
            Some(FileTransfer::Upload { reader, len }) => (Some((reader, len)), None),
            Some(FileTransfer::Download { writer }) => (None, Some(writer)),
            None => (None, None),
        };

        let mut request = apply_options(client.request(http_method(method), &url), &options);
        let failure = FailureSlot::default();
        let uploaded = Arc::new(AtomicU64::new(0));
        let upload_total = match upload {
            Some((reader, len)) => {
                let body = upload_body(reader, uploaded.clone(), failure.clone())?;
                request = request.header(CONTENT_LENGTH, len).body(body);
                len
            },
            None => {
                let len = request_body_len(&options);
                uploaded.store(len, Ordering::Relaxed);
                len
            },
        };

        let before_send = RequestProgress {
            upload_total,
            ..RequestProgress::default()
        };
        if progress(before_send) == TransferFlow::Abort {
            return Err(TransferError::cancelled());
        }

        let exchange = Exchange {
            request,
            progress,
            upload_total,
            uploaded,
            failure,
            download,
        };
        self.runtime()?.block_on(exchange.run())
    }

    /// Client for `profile`, rebuilt when the profile changed since the last transfer.
    fn client_for(&mut self, profile: ClientProfile) -> Result<&Client, TransferError> {
        let reusable = self
            .client
            .as_ref()
            .is_some_and(|(current, _)| *current == profile);
        if !reusable {
            tracing::trace!(?profile, "building http client");
            let client = build_client(&profile, &self.config, self.redirects.clone())?;
            self.client = Some((profile, client));
        }
        self.client
            .as_ref()
            .map(|(_, client)| client)
            .ok_or_else(|| TransferError::new(ErrorCode::InternalError, "no http client"))
    }

    /// Runtime of this session, started on first use.
    fn runtime(&mut self) -> Result<&Runtime, TransferError> {
        if self.runtime.is_none() {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|error| TransferError::new(ErrorCode::InternalError, error.to_string()))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| TransferError::new(ErrorCode::InternalError, "no runtime"))
    }
}

/// A prepared request and everything needed to drive it to a response.
struct Exchange {
    /// Request, options applied.
    request: RequestBuilder,
    /// Progress hook.
    progress: ProgressHook,
    /// Size of the request body.
    upload_total: u64,
    /// Request body bytes handed to the connection so far.
    uploaded: Arc<AtomicU64>,
    /// Why the upload stopped early.
    failure: FailureSlot,
    /// Download destination, the response body stays in memory without one.
    download: Option<Box<dyn Write + Send>>,
}

impl Exchange {
    /// Sends the request and reads the response. Every wait is raced against the
    /// progress interval, and an abort from the hook drops the connection.
    async fn run(self) -> Result<Response, TransferError> {
        let Self {
            request,
            progress,
            upload_total,
            uploaded,
            failure,
            mut download,
        } = self;
        let mut ticker = time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = RequestProgress {
            upload_total,
            ..RequestProgress::default()
        };

        let send = request.send();
        tokio::pin!(send);
        let mut reply = loop {
            tokio::select! {
                sent = &mut send => {
                    break sent.map_err(|error| {
                        failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take()
                            .unwrap_or_else(|| classify(&error))
                    })?;
                },
                _ = ticker.tick() => {
                    tick.upload_now = uploaded.load(Ordering::Relaxed);
                    if progress(tick) == TransferFlow::Abort {
                        return Err(TransferError::cancelled());
                    }
                },
            }
        };

        let mut response = Response {
            status_code: reply.status().as_u16(),
            reason: reply
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            url: reply.url().to_string(),
            uploaded_bytes: upload_total,
            ..Response::default()
        };
        for (name, value) in reply.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if *name == SET_COOKIE {
                if let Some((key, cookie)) = parse_set_cookie(&value) {
                    response.cookies.insert(key, cookie);
                }
            }
            response.headers.insert(name.as_str().to_string(), value);
        }

        tick.upload_now = upload_total;
        tick.download_total = reply
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse().ok())
            .unwrap_or_default();
        let mut body = Vec::new();
        let sink: &mut dyn Write = match download.as_mut() {
            Some(writer) => writer.as_mut(),
            None => &mut body,
        };
        loop {
            let chunk = tokio::select! {
                chunk = reply.chunk() => chunk.map_err(|error| classify(&error))?,
                _ = ticker.tick() => {
                    if progress(tick) == TransferFlow::Abort {
                        return Err(TransferError::cancelled());
                    }
                    continue;
                },
            };
            let Some(chunk) = chunk else {
                break;
            };
            sink.write_all(&chunk)
                .map_err(|error| TransferError::new(ErrorCode::FileWriteError, error.to_string()))?;
            tick.download_now = tick.download_now.saturating_add(chunk.len() as u64);
            if progress(tick) == TransferFlow::Abort {
                return Err(TransferError::cancelled());
            }
        }
        sink.flush()
            .map_err(|error| TransferError::new(ErrorCode::FileWriteError, error.to_string()))?;

        response.body = body;
        response.downloaded_bytes = tick.download_now;
        Ok(response)
    }
}

/// Builds a client for `profile`.
fn build_client(
    profile: &ClientProfile, config: &ReqwestConfig, redirects: Arc<AtomicU32>,
) -> Result<Client, TransferError> {
    let policy = redirect::Policy::custom(move |attempt| {
        let followed = attempt.previous().len();
        redirects.store(u32::try_from(followed).unwrap_or(u32::MAX), Ordering::Relaxed);
        if followed > MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    });

    let mut builder = Client::builder()
        .redirect(policy)
        .https_only(profile.https_only);

    if let Some(timeout) = profile.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(proxy_url) = &profile.proxy_url {
        let mut proxy = Proxy::all(proxy_url.as_str()).map_err(|error| {
            TransferError::new(ErrorCode::ProxyResolutionFailure, error.to_string())
        })?;
        if let Some(auth) = &profile.proxy_auth {
            proxy = proxy.basic_auth(&auth.user, &auth.password);
        }
        builder = builder.proxy(proxy);
    }
    if let Some(path) = &config.ca_cert_path {
        let certificate = fs::read(path)
            .map_err(|error| error.to_string())
            .and_then(|pem| Certificate::from_pem(&pem).map_err(|error| error.to_string()))
            .map_err(|error| {
                TransferError::new(
                    ErrorCode::SslCaCertError,
                    format!("{}: {error}", path.display()),
                )
            })?;
        builder = builder.add_root_certificate(certificate);
    }

    builder
        .build()
        .map_err(|error| TransferError::new(ErrorCode::InternalError, error.to_string()))
}

/// Rejects URLs this transport cannot serve before any connection is made.
fn check_url(url: &str, options: &RequestOptions) -> Result<(), TransferError> {
    let parsed = url::Url::parse(url)
        .map_err(|error| TransferError::new(ErrorCode::InvalidUrlFormat, error.to_string()))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if !options.require_secure => Ok(()),
        "http" => Err(TransferError::new(
            ErrorCode::UnsupportedProtocol,
            "TLS is required but the URL is plain http",
        )),
        scheme => Err(TransferError::new(
            ErrorCode::UnsupportedProtocol,
            format!("Unsupported protocol `{scheme}`"),
        )),
    }
}

/// Wire method of a request method.
fn http_method(method: RequestMethod) -> Method {
    match method {
        RequestMethod::Get | RequestMethod::FtpDownload => Method::GET,
        RequestMethod::Post => Method::POST,
        RequestMethod::Put | RequestMethod::FtpUpload => Method::PUT,
        RequestMethod::Patch => Method::PATCH,
        RequestMethod::Delete => Method::DELETE,
    }
}

/// Applies the per-request options. A raw body replaces the form payload, content
/// type included.
fn apply_options(mut request: RequestBuilder, options: &RequestOptions) -> RequestBuilder {
    if let Some(user_agent) = &options.user_agent {
        request = request.header(USER_AGENT, user_agent.as_str());
    }
    if !options.url_parameters.is_empty() {
        request = request.query(&options.url_parameters);
    }
    match &options.body {
        Some(body) => request = request.body(body.clone()),
        None if !options.form_payload.is_empty() => request = request.form(&options.form_payload),
        None => {},
    }
    for (key, value) in &options.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    if !options.cookies.is_empty() {
        request = request.header(COOKIE, cookie_header(&options.cookies));
    }
    if let Some(timeout) = options.timeout {
        request = request.timeout(timeout);
    }
    if let Some(auth) = &options.auth {
        request = request.basic_auth(&auth.user, Some(&auth.password));
    }
    request
}

/// Size of the in-memory request body.
fn request_body_len(options: &RequestOptions) -> u64 {
    let len = match &options.body {
        Some(body) => body.len(),
        None => {
            options
                .form_payload
                .iter()
                .map(|(key, value)| key.len().saturating_add(value.len()).saturating_add(2))
                .sum()
        },
    };
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Streaming request body fed from `reader` by a dedicated thread.
fn upload_body(
    reader: Box<dyn Read + Send>, sent: Arc<AtomicU64>, failure: FailureSlot,
) -> Result<Body, TransferError> {
    let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
    thread::Builder::new()
        .name("ezhttp-upload".to_string())
        .spawn(move || pump_upload(reader, &tx, &sent, &failure))
        .map_err(|error| TransferError::new(ErrorCode::InternalError, error.to_string()))?;
    Ok(Body::wrap_stream(ReceiverStream::new(rx)))
}

/// Moves `reader` into the body channel chunk by chunk. Stops at the end of the
/// source, on a read error (recorded in `failure`) or once the body is dropped.
fn pump_upload(
    mut reader: Box<dyn Read + Send>, tx: &mpsc::Sender<io::Result<Vec<u8>>>, sent: &AtomicU64,
    failure: &Mutex<Option<TransferError>>,
) {
    loop {
        let mut chunk = vec![0; READ_CHUNK];
        let read = match reader.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                let reason = TransferError::new(ErrorCode::FileReadError, error.to_string());
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
                // The receiver is gone when the transfer already stopped.
                tx.blocking_send(Err(error)).ok();
                return;
            },
        };
        chunk.truncate(read);
        sent.fetch_add(read as u64, Ordering::Relaxed);
        if tx.blocking_send(Ok(chunk)).is_err() {
            return;
        }
    }
}

/// `Cookie` header value for the given cookies.
fn cookie_header(cookies: &[(String, String)]) -> String {
    let mut header = String::new();
    for (name, value) in cookies {
        if !header.is_empty() {
            header.push_str("; ");
        }
        let _ = write!(header, "{name}={value}");
    }
    header
}

/// Name and value of a `Set-Cookie` header, attributes are ignored.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Maps a `reqwest` failure onto an error code.
fn classify(error: &::reqwest::Error) -> TransferError {
    let detail = error_chain(error);
    let lowered = detail.to_lowercase();

    let code = if error.is_timeout() {
        ErrorCode::OperationTimedOut
    } else if error.is_redirect() {
        ErrorCode::TooManyRedirects
    } else if error.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            ErrorCode::HostResolutionFailure
        } else if lowered.contains("certificate") || lowered.contains("tls") {
            ErrorCode::SslConnectError
        } else if lowered.contains("proxy") {
            ErrorCode::ProxyResolutionFailure
        } else {
            ErrorCode::ConnectionFailure
        }
    } else if error.is_builder() {
        ErrorCode::InternalError
    } else if error.is_body() || error.is_decode() {
        ErrorCode::NetworkReceiveError
    } else if lowered.contains("connection closed before message completed") {
        ErrorCode::EmptyResponse
    } else if error.is_request() {
        ErrorCode::NetworkSendFailure
    } else {
        ErrorCode::UnknownError
    };
    TransferError::new(code, detail)
}

/// The error and all of its sources, joined.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(detail, ": {cause}");
        source = cause.source();
    }
    detail
}
