//! Running async tool calls from synchronous call sites.
//!
//! Without a runtime on the calling thread a private current-thread
//! runtime drives the call. Inside a runtime the call is handed to a small
//! pool of worker threads, each with its own runtime, and the caller waits
//! for the result with a deadline. The caller's runtime is never re-entered.
//!
//! Futures handed over here must not need the caller's runtime to make
//! progress. MCP transports satisfy this by running their I/O on a runtime
//! of their own, so blocking from a current-thread runtime is fine.
//!
//! At most `2 * workers` calls may be waiting for a worker. Calls beyond
//! that fail at once with [`ToolbridgeError::BlockingCall`] rather than
//! queueing without bound.

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Handle, Runtime};
use toolbridge_core::{Result, ToolbridgeError};
use tracing::debug;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_WAIT: Duration = Duration::from_secs(120);

type Job = BoxFuture<'static, ()>;

pub struct BlockingBridge {
    workers: usize,
    wait: Duration,
    queue: OnceCell<SyncSender<Job>>,
}

impl Default for BlockingBridge {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_WAIT)
    }
}

impl BlockingBridge {
    /// Workers are spawned on first use from inside a runtime.
    pub fn new(workers: usize, wait: Duration) -> Self {
        Self {
            workers: workers.max(1),
            wait,
            queue: OnceCell::new(),
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Drive `future` to completion and return its output.
    ///
    /// Inside a runtime this blocks for at most [`wait`](Self::wait). A
    /// full worker queue is reported as a `BlockingCall` error immediately.
    pub fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_err() {
            let runtime = private_runtime()?;
            return Ok(runtime.block_on(future));
        }

        let queue = self.queue.get_or_try_init(|| self.spawn_workers())?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::pin(async move {
            // The caller may have given up already.
            let _ = reply_tx.send(future.await);
        });

        queue.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => {
                ToolbridgeError::BlockingCall("all bridge workers are busy".to_string())
            }
            TrySendError::Disconnected(_) => {
                ToolbridgeError::BlockingCall("bridge workers have stopped".to_string())
            }
        })?;

        match reply_rx.recv_timeout(self.wait) {
            Ok(output) => Ok(output),
            Err(RecvTimeoutError::Timeout) => Err(ToolbridgeError::BlockingCall(format!(
                "no result within {}s",
                self.wait.as_secs_f64()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(ToolbridgeError::BlockingCall(
                "worker dropped the call".to_string(),
            )),
        }
    }

    fn spawn_workers(&self) -> Result<SyncSender<Job>> {
        let (tx, rx) = mpsc::sync_channel::<Job>(self.workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..self.workers {
            let rx = Arc::clone(&rx);
            let runtime = private_runtime()?;
            thread::Builder::new()
                .name(format!("toolbridge-bridge-{index}"))
                .spawn(move || loop {
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    match next {
                        Ok(job) => runtime.block_on(job),
                        Err(_) => {
                            debug!("Bridge worker {} stopping", index);
                            break;
                        }
                    }
                })?;
        }

        debug!("Started {} bridge workers", self.workers);
        Ok(tx)
    }
}

fn private_runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}
