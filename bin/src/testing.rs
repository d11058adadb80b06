//! Scripted transport and helpers for unit tests.

use std::{
    io::{Read as _, Write as _},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    control::{RequestProgress, TransferFlow},
    response::{ErrorCode, Response, TransferError},
    transport::{FileTransfer, Session, Transfer, Transport},
};

/// State shared by a stub transport and all of its sessions.
#[derive(Default)]
struct StubState {
    /// Id of the last session created.
    last_id: AtomicU32,
    /// While set, transfers keep reporting progress instead of finishing.
    held: AtomicBool,
    /// `(session id, url)` of every transfer, in start order.
    performed: Mutex<Vec<(u32, String)>>,
}

/// Transport whose sessions answer `200` with the URL as the body.
#[derive(Clone, Default)]
pub(crate) struct StubTransport {
    /// Shared state.
    state: Arc<StubState>,
}

impl StubTransport {
    /// A transport whose transfers block until [`StubTransport::release`].
    pub(crate) fn held() -> Self {
        let transport = Self::default();
        transport.state.held.store(true, Ordering::SeqCst);
        transport
    }

    /// Lets held transfers finish.
    pub(crate) fn release(&self) {
        self.state.held.store(false, Ordering::SeqCst);
    }

    /// Number of sessions created so far.
    pub(crate) fn created(&self) -> u32 {
        self.state.last_id.load(Ordering::SeqCst)
    }

    /// Every transfer started so far.
    pub(crate) fn performed(&self) -> Vec<(u32, String)> {
        self.state
            .performed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for StubTransport {
    type Session = StubSession;

    fn create_session(&self) -> StubSession {
        let id = self
            .state
            .last_id
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        StubSession {
            id,
            state: self.state.clone(),
        }
    }
}

/// Session of a [`StubTransport`].
pub(crate) struct StubSession {
    /// Creation order, starting at 1.
    id: u32,
    /// Shared state.
    state: Arc<StubState>,
}

impl std::fmt::Debug for StubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StubSession").field(&self.id).finish()
    }
}

impl StubSession {
    /// Creation order of this session.
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

impl Session for StubSession {
    fn perform(&mut self, transfer: Transfer) -> Response {
        self.state
            .performed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.id, transfer.url.clone()));

        let mut progress = RequestProgress::default();
        loop {
            progress.download_now = progress.download_now.saturating_add(1);
            if (transfer.progress)(progress) == TransferFlow::Abort {
                return Response::from_error(&transfer.url, TransferError::cancelled());
            }
            if !self.state.held.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut response = Response {
            status_code: 200,
            reason: "OK".to_string(),
            body: transfer.url.clone().into_bytes(),
            url: transfer.url.clone(),
            ..Response::default()
        };
        response
            .headers
            .insert("x-session".to_string(), self.id.to_string());

        match transfer.file {
            Some(FileTransfer::Upload { mut reader, .. }) => {
                let mut sent = Vec::new();
                if let Err(error) = reader.read_to_end(&mut sent) {
                    return Response::from_error(
                        &transfer.url,
                        TransferError::new(ErrorCode::FileReadError, error.to_string()),
                    );
                }
                response.uploaded_bytes = sent.len() as u64;
            },
            Some(FileTransfer::Download { mut writer }) => {
                if let Err(error) = writer.write_all(&response.body) {
                    return Response::from_error(
                        &transfer.url,
                        TransferError::new(ErrorCode::FileWriteError, error.to_string()),
                    );
                }
                response.downloaded_bytes = response.body.len() as u64;
                response.body.clear();
            },
            None => response.downloaded_bytes = response.body.len() as u64,
        }
        response
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
