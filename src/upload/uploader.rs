//! Build Event Uploader
//!
//! Public face of the pipeline. Producers call `enqueue` for every build
//! event and `close` once; the returned `CompletionSignal` resolves when the
//! upload has finished, one way or another.
//!
//! The worker task is started lazily by the first `enqueue` or `close`.
//! Producers only touch the queue and a few fields behind one lock; all
//! stream state lives on the worker.

use crate::upload::clock::{ProductionClock, UploadClock};
use crate::upload::config::{ConfigError, UploaderConfig};
use crate::upload::error::UploadError;
use crate::upload::event::{BuildEvent, BuildStatus, EventEnvelope, StreamId};
use crate::upload::local_files::{LocalFileUploadCoordinator, LocalFileUploader};
use crate::upload::queue::{Command, EventQueue};
use crate::upload::sequencer::Sequencer;
use crate::upload::serializer::{EventSerializer, JsonEventSerializer};
use crate::upload::stats::{StatsRecorder, UploadStats};
use crate::upload::transport::StreamClient;
use crate::upload::upload_loop::UploadLoop;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type UploadResult = Result<(), UploadError>;

/// Resolves once, when the upload has terminated
///
/// Clones observe the same resolution. Every `close()` call on an uploader
/// hands out a clone of the same signal.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Shared<BoxFuture<'static, UploadResult>>,
}

impl CompletionSignal {
    fn new(rx: oneshot::Receiver<UploadResult>) -> Self {
        let future = async move {
            rx.await.unwrap_or_else(|_| {
                Err(UploadError::Internal(
                    "upload worker exited without reporting a result".to_string(),
                ))
            })
        }
        .boxed()
        .shared();
        CompletionSignal { inner: future }
    }

    pub async fn wait(&self) -> UploadResult {
        self.inner.clone().await
    }

    /// The result, if some waiter has already observed it
    pub fn try_result(&self) -> Option<UploadResult> {
        self.inner.peek().cloned()
    }

    /// True if both handles refer to the same underlying signal
    pub fn same_signal(&self, other: &CompletionSignal) -> bool {
        Shared::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("result", &self.try_result())
            .finish()
    }
}

/// Fields shared between producers, guarded by one lock
struct ControllerState {
    worker: Option<JoinHandle<()>>,
    completion_tx: Option<oneshot::Sender<UploadResult>>,
    close_requested: bool,
    build_status: BuildStatus,
}

/// Streams build events to a remote build event service
pub struct BuildEventUploader<C: UploadClock = ProductionClock> {
    config: UploaderConfig,
    clock: C,
    runtime: Handle,
    queue: Arc<EventQueue>,
    sequencer: Sequencer,
    files: Arc<LocalFileUploadCoordinator>,
    client: Arc<dyn StreamClient>,
    serializer: Arc<dyn EventSerializer>,
    interrupt: CancellationToken,
    timed_out: Arc<AtomicBool>,
    stats: Arc<StatsRecorder>,
    completion: CompletionSignal,
    state: Mutex<ControllerState>,
}

impl BuildEventUploader<ProductionClock> {
    /// Uploader with JSON serialization and the system clock. Must be called
    /// from within a tokio runtime; the worker is spawned onto it.
    pub fn new(
        config: UploaderConfig,
        client: Arc<dyn StreamClient>,
        file_uploader: Arc<dyn LocalFileUploader>,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(
            config,
            client,
            file_uploader,
            Arc::new(JsonEventSerializer),
            ProductionClock::new(),
        )
    }
}

impl<C: UploadClock> BuildEventUploader<C> {
    pub fn with_parts(
        config: UploaderConfig,
        client: Arc<dyn StreamClient>,
        file_uploader: Arc<dyn LocalFileUploader>,
        serializer: Arc<dyn EventSerializer>,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?;
        let (completion_tx, completion_rx) = oneshot::channel();

        Ok(BuildEventUploader {
            files: Arc::new(LocalFileUploadCoordinator::new(
                file_uploader,
                runtime.clone(),
            )),
            config,
            clock,
            runtime,
            queue: Arc::new(EventQueue::new()),
            sequencer: Sequencer::new(),
            client,
            serializer,
            interrupt: CancellationToken::new(),
            timed_out: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsRecorder::default()),
            completion: CompletionSignal::new(completion_rx),
            state: Mutex::new(ControllerState {
                worker: None,
                completion_tx: Some(completion_tx),
                close_requested: false,
                build_status: BuildStatus::Unknown,
            }),
        })
    }

    /// Queue a build event for upload. Its local files start uploading right
    /// away. Events arriving after `close` are dropped and their uploads
    /// cancelled.
    pub fn enqueue(&self, event: BuildEvent) {
        // Outside the lock: starting an upload may block or log.
        let upload = self.files.begin_upload(&event.local_files);

        let mut state = self.state.lock();
        if state.close_requested {
            drop(state);
            upload.cancel();
            self.stats.event_dropped();
            debug!(name = %event.name, "Dropping build event enqueued after close");
            return;
        }

        if let Some(exit_code) = event.exit_code {
            if state.build_status == BuildStatus::Unknown {
                state.build_status = BuildStatus::from_exit_code(exit_code);
            }
        }
        self.start_worker_if_needed(&mut state);

        // Sequence assignment and queueing happen under the same lock so the
        // queue order always matches sequence order.
        let envelope =
            EventEnvelope::new(self.sequencer.next(), self.clock.now(), event, upload);
        self.queue.push_back(Command::SendRegular(envelope));
        self.stats.event_enqueued();
    }

    /// Request a graceful close. Idempotent: later calls return the same
    /// signal and enqueue nothing.
    pub fn close(&self) -> CompletionSignal {
        let mut state = self.state.lock();
        if state.close_requested {
            return self.completion.clone();
        }
        state.close_requested = true;
        self.start_worker_if_needed(&mut state);

        let sequence_number = self.sequencer.next();
        self.queue.push_back(Command::SendLast {
            sequence_number,
            timestamp: self.clock.now(),
        });
        drop(state);

        info!(last_sequence = sequence_number, "Closing build event upload");
        if !self.config.close_timeout.is_zero() {
            self.arm_close_timeout();
        }
        self.completion.clone()
    }

    /// Abort the upload now. The signal resolves with `Interrupted`.
    pub fn interrupt(&self) {
        warn!("Build event upload interrupted");
        self.interrupt.cancel();
    }

    pub fn build_status(&self) -> BuildStatus {
        self.state.lock().build_status
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().close_requested
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    fn arm_close_timeout(&self) {
        let timeout = self.config.close_timeout;
        let completion = self.completion.clone();
        let interrupt = self.interrupt.clone();
        let timed_out = Arc::clone(&self.timed_out);
        self.runtime.spawn(async move {
            if tokio::time::timeout(timeout, completion.wait()).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Build event upload did not finish in time, aborting"
                );
                // Flag first, so the worker reports a timeout rather than a plain interrupt.
                timed_out.store(true, Ordering::SeqCst);
                interrupt.cancel();
            }
        });
    }

    fn start_worker_if_needed(&self, state: &mut ControllerState) {
        let completion_tx = match state.completion_tx.take() {
            Some(tx) => tx,
            None => return,
        };

        self.queue.push_front(Command::OpenStream);
        let upload_loop = UploadLoop {
            queue: Arc::clone(&self.queue),
            client: Arc::clone(&self.client),
            serializer: Arc::clone(&self.serializer),
            retry: self.config.retry.clone(),
            stream_id: StreamId {
                build_id: self.config.build_id.clone(),
                invocation_id: self.config.invocation_id.clone(),
            },
            interrupt: self.interrupt.clone(),
            stats: Arc::clone(&self.stats),
        };
        let timed_out = Arc::clone(&self.timed_out);
        let close_timeout = self.config.close_timeout;
        let files = Arc::clone(&self.files);

        debug!(build_id = %self.config.build_id, "Starting build event upload worker");
        state.worker = Some(self.runtime.spawn(async move {
            let result = match upload_loop.run().await {
                Err(UploadError::Interrupted) if timed_out.load(Ordering::SeqCst) => {
                    Err(UploadError::Timeout {
                        after: close_timeout,
                    })
                }
                other => other,
            };
            files.shutdown();
            match &result {
                Ok(()) => info!("Build event upload complete"),
                Err(e) => error!(kind = ?e.kind(), error = %e, "Build event upload failed"),
            }
            let _ = completion_tx.send(result);
        }));
    }
}

impl<C: UploadClock> Drop for BuildEventUploader<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // A started but never closed upload would wait on the queue forever.
        if state.worker.is_some() && !state.close_requested {
            self.interrupt.cancel();
        }
    }
}

impl<C: UploadClock> fmt::Debug for BuildEventUploader<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildEventUploader")
            .field("build_id", &self.config.build_id)
            .field("invocation_id", &self.config.invocation_id)
            .field("queued", &self.queue.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
