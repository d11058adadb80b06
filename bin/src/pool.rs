//! Fixed-size worker pool that runs the transfers of one engine.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    thread::JoinHandle,
};

use anyhow::anyhow;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// A unit of work.
pub(crate) type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Single worker thread.
struct Worker {
    /// Handle to join on termination.
    handle: JoinHandle<()>,
}

/// Message sent to the workers.
enum Message {
    /// Run a job.
    Job(Job),
    /// Stop the worker.
    Shutdown,
}

/// Spawns a worker which runs jobs one by one until told to stop.
fn spawn(receiver: Receiver<Message>) -> Worker {
    let handle = std::thread::spawn(move || {
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Job(job) => {
                    if let Err(err) = job() {
                        tracing::error!("Job execution failed: {err}");
                    }
                },
                Message::Shutdown => break,
            }
        }
    });

    Worker { handle }
}

/// Worker pool with a shared job queue.
pub(crate) struct Pool {
    /// Worker handles, taken on termination.
    workers: Mutex<Vec<Worker>>,
    /// Job queue.
    queue: Sender<Message>,
    /// Has `terminate()` been called.
    terminated: AtomicBool,
}

impl Pool {
    /// Starts `threads` workers, at least one.
    pub(crate) fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Message>();
        let workers = (0..threads.max(1))
            .map(|_| spawn(receiver.clone()))
            .collect();

        Self {
            workers: Mutex::new(workers),
            queue: sender,
            terminated: AtomicBool::default(),
        }
    }

    /// Queues a job.
    ///
    /// # Errors
    /// - The pool has been terminated.
    pub(crate) fn execute(&self, job: Job) -> anyhow::Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(anyhow!("Worker pool is shut down"));
        }

        self.queue
            .send(Message::Job(job))
            .map_err(|_| anyhow!("Worker pool is shut down"))
    }

    /// Stops every worker after the jobs queued before this call, and joins them.
    /// Calling it again does nothing.
    ///
    /// # Errors
    /// - A worker could not be signalled or joined.
    pub(crate) fn terminate(&self) -> anyhow::Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for _ in 0..workers.len() {
            self.queue
                .send(Message::Shutdown)
                .map_err(|err| anyhow!("failed to send shutdown signal: {err}"))?;
        }
        for worker in workers {
            worker
                .handle
                .join()
                .map_err(|_err| anyhow!("failed to terminate worker"))?;
        }

        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            tracing::error!("Worker pool termination failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn queued_jobs_run_before_termination() {
        let pool = Pool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            let queued = pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            assert!(queued.is_ok());
        }

        assert!(pool.terminate().is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn terminated_pool_refuses_jobs() {
        let pool = Pool::new(0);
        assert!(pool.terminate().is_ok());
        assert!(pool.terminate().is_ok());
        assert!(pool.execute(Box::new(|| Ok(()))).is_err());
    }

    #[test]
    fn failing_job_does_not_kill_the_worker() {
        let pool = Pool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        assert!(pool.execute(Box::new(|| Err(anyhow!("boom")))).is_ok());
        let after = ran.clone();
        assert!(pool
            .execute(Box::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .is_ok());

        assert!(pool.terminate().is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
