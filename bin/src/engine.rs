//! Request engine: transfers run on a worker pool, their completions are queued and
//! delivered to the callbacks only from [`RequestEngine::run_frame`].
//!
//! Every request is a unit keyed by a private id. The unit keeps the callback on the
//! engine side, so callbacks never cross threads. Workers only send the id and the
//! response back over the completion channel.

use std::{
    collections::HashMap,
    fs::{self, File},
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::anyhow;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::{
    clock::Clock,
    config::EngineConfig,
    control::RequestControl,
    options::{RequestMethod, RequestOptions},
    pool::Pool,
    response::{ErrorCode, Response, TransferError},
    session_cache::SessionCache,
    transport::{FileTransfer, ProgressHook, Session, Transfer, Transport},
};

/// Completion callback of a request. Runs on the thread calling `run_frame`.
pub type RequestCallback = Box<dyn FnOnce(Response)>;

/// A completed transfer on its way back to the engine thread.
type Completion = (u64, Response);

/// An in-flight request.
struct Unit {
    /// Control block shared with the caller.
    control: Arc<RequestControl>,
    /// Callback, taken on delivery.
    callback: RequestCallback,
    /// Set by `forget_all_requests`, also covers transfers that already completed.
    suppressed: bool,
}

/// Worker pool plus single-threaded completion queue.
pub struct RequestEngine<T: Transport> {
    /// Engine settings.
    config: EngineConfig,
    /// Sessions shared by all workers of this engine.
    cache: Arc<SessionCache<T>>,
    /// Workers running the transfers.
    pool: Pool,
    /// Sending side of the completion queue, cloned into every job.
    completed_tx: Sender<Completion>,
    /// Receiving side of the completion queue, drained by `run_frame`.
    completed_rx: Receiver<Completion>,
    /// In-flight requests by unit id.
    units: HashMap<u64, Unit>,
    /// Id of the next unit.
    next_unit: u64,
}

impl<T: Transport> RequestEngine<T> {
    /// Starts an engine with `config.threads` workers.
    pub fn new(transport: Arc<T>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let cache = SessionCache::new(
            transport,
            clock,
            config.session_max_age,
            config.max_sessions_per_host,
        );
        let (completed_tx, completed_rx) = unbounded();

        Self {
            pool: Pool::new(config.threads),
            config,
            cache: Arc::new(cache),
            completed_tx,
            completed_rx,
            units: HashMap::new(),
            next_unit: 0,
        }
    }

    /// Engine settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a transfer. `on_complete` is called from a later `run_frame`, unless
    /// the request gets forgotten first.
    ///
    /// Upload and download methods open the file at the options' file path right
    /// away. If that fails the error response is queued without starting a transfer.
    pub fn send_request(
        &mut self, method: RequestMethod, url: impl Into<String>, options: Arc<RequestOptions>,
        on_complete: impl FnOnce(Response) + 'static,
    ) -> Arc<RequestControl> {
        let url = url.into();
        let control = Arc::new(RequestControl::new());
        let unit_id = self.next_unit;
        self.next_unit = self.next_unit.wrapping_add(1);
        self.units.insert(unit_id, Unit {
            control: control.clone(),
            callback: Box::new(on_complete),
            suppressed: false,
        });
        tracing::debug!(unit = unit_id, ?method, %url, "request dispatched");

        let file = if method.is_file_transfer() {
            match open_file(method, &options) {
                Ok(file) => Some(file),
                Err(error) => {
                    self.post(unit_id, &control, Response::from_error(&url, error));
                    return control;
                },
            }
        } else {
            None
        };

        let job = TransferJob {
            unit_id,
            method,
            url: url.clone(),
            options,
            file,
            control: control.clone(),
            cache: self.cache.clone(),
            completed_tx: self.completed_tx.clone(),
        };
        if let Err(err) = self.pool.execute(Box::new(move || job.run())) {
            let error = TransferError::new(ErrorCode::InternalError, err.to_string());
            self.post(unit_id, &control, Response::from_error(&url, error));
        }
        control
    }

    /// Delivers up to `frame_budget` completions and returns how many were taken off
    /// the queue. Completions of forgotten requests are dropped.
    pub fn run_frame(&mut self) -> usize {
        let budget = self.config.frame_budget.max(1);
        let mut processed = 0;
        while processed < budget {
            let (unit_id, response) = match self.completed_rx.try_recv() {
                Ok(completion) => completion,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            processed += 1;

            let Some(unit) = self.units.remove(&unit_id) else {
                continue;
            };
            if unit.suppressed || unit.control.is_forgotten() {
                tracing::debug!(unit = unit_id, "completion of forgotten request dropped");
                continue;
            }
            tracing::debug!(
                unit = unit_id,
                status = response.status_code,
                error = response.error_message(),
                "request completed"
            );
            (unit.callback)(response);
        }
        processed
    }

    /// Requests whose completion has not been processed yet.
    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.units.len()
    }

    /// Cancels every in-flight request. Does not wait for the transfers to stop.
    pub fn cancel_all_requests(&self) {
        for unit in self.units.values() {
            unit.control.cancel();
        }
    }

    /// Makes sure no callback of the current requests ever runs. Transfers keep
    /// running and still return their sessions.
    pub fn forget_all_requests(&mut self) {
        for unit in self.units.values_mut() {
            unit.control.forget();
            unit.suppressed = true;
        }
    }

    /// Number of sessions pooled for `host`.
    #[must_use]
    pub fn pooled_sessions(&self, host: &str) -> usize {
        self.cache.pooled_count(host)
    }

    /// Completes a request without running a transfer.
    fn post(&self, unit_id: u64, control: &RequestControl, response: Response) {
        control.complete();
        if self.completed_tx.send((unit_id, response)).is_err() {
            tracing::error!(unit = unit_id, "completion queue closed");
        }
    }
}

impl<T: Transport> Drop for RequestEngine<T> {
    fn drop(&mut self) {
        while !self.units.is_empty() {
            if self.run_frame() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        if let Err(err) = self.pool.terminate() {
            tracing::error!("Failed to stop request workers: {err}");
        }
    }
}

/// Opens the file side of an upload or download.
fn open_file(
    method: RequestMethod, options: &RequestOptions,
) -> Result<(FileTransfer, Option<PathBuf>), TransferError> {
    let upload = method == RequestMethod::FtpUpload;
    let code = if upload {
        ErrorCode::FileReadError
    } else {
        ErrorCode::FileWriteError
    };
    let path = options
        .file_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| TransferError::new(code, "No file path set"))?;
    let failed =
        |error: std::io::Error| TransferError::new(code, format!("{}: {error}", path.display()));

    if upload {
        let file = File::open(&path).map_err(failed)?;
        let len = file.metadata().map_err(failed)?.len();
        Ok((
            FileTransfer::Upload {
                reader: Box::new(file),
                len,
            },
            None,
        ))
    } else {
        let file = File::create(&path).map_err(failed)?;
        Ok((
            FileTransfer::Download {
                writer: Box::new(file),
            },
            Some(path),
        ))
    }
}

/// Everything a worker needs to run one request.
struct TransferJob<T: Transport> {
    /// Unit the completion belongs to.
    unit_id: u64,
    /// Request method.
    method: RequestMethod,
    /// Target URL.
    url: String,
    /// Request options.
    options: Arc<RequestOptions>,
    /// Opened file and, for downloads, its path.
    file: Option<(FileTransfer, Option<PathBuf>)>,
    /// Control block shared with the caller.
    control: Arc<RequestControl>,
    /// Session cache of the engine.
    cache: Arc<SessionCache<T>>,
    /// Completion queue of the engine.
    completed_tx: Sender<Completion>,
}

impl<T: Transport> TransferJob<T> {
    /// Runs the transfer and queues its completion.
    fn run(self) -> anyhow::Result<()> {
        let Self {
            unit_id,
            method,
            url,
            options,
            file,
            control,
            cache,
            completed_tx,
        } = self;
        let (file, download_path) = file.map_or((None, None), |(file, path)| (Some(file), path));

        let response = if control.is_cancelled() {
            drop(file);
            Response::from_error(&url, TransferError::cancelled())
        } else {
            let mut pooled = cache.get_session(&url);
            let hook_control = control.clone();
            let progress: ProgressHook = Arc::new(move |tick| hook_control.report_progress(tick));
            let transfer = Transfer {
                method,
                url: url.clone(),
                options,
                progress,
                file,
            };
            let performed =
                panic::catch_unwind(AssertUnwindSafe(|| pooled.session_mut().perform(transfer)));
            match performed {
                Ok(response) => {
                    cache.return_session(pooled);
                    response
                },
                Err(_) => {
                    tracing::error!(unit = unit_id, %url, "transport panicked, session dropped");
                    let error = TransferError::new(ErrorCode::InternalError, "Transport panicked");
                    Response::from_error(&url, error)
                },
            }
        };

        if response.is_cancelled() {
            if let Some(path) = download_path {
                if let Err(error) = fs::remove_file(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        %error,
                        "failed to remove partial download"
                    );
                }
            }
        }

        control.complete();
        completed_tx
            .send((unit_id, response))
            .map_err(|_| anyhow!("Completion queue of unit {unit_id} is closed"))
    }
}
