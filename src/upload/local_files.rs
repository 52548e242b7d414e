//! Local-File Upload Coordination
//!
//! Build events may reference files on the local disk (test logs, outputs).
//! Those files are staged remotely before the event is transmitted, so the
//! event can name the remote copy instead of a local path.
//!
//! `LocalFileUploadCoordinator::begin_upload` starts staging in the
//! background and hands back a `LocalFileUpload`. The upload loop waits on it
//! right before transmitting the owning event; that wait is the only
//! backpressure between producers and the stream.
//!
//! Dropping a `LocalFileUpload` whose task is still running aborts the task,
//! so an event discarded during teardown never leaves a stray upload behind.

use crate::upload::error::LocalFileUploadError;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a referenced file is, as far as the remote service cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalFileType {
    Output,
    Log,
    Stdout,
    Stderr,
    Other,
}

/// A file on local disk referenced by a build event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub file_type: LocalFileType,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>, file_type: LocalFileType) -> Self {
        LocalFile {
            path: path.into(),
            file_type,
        }
    }
}

/// Maps local paths to the URIs events should carry after staging
pub trait PathConverter: Send + Sync {
    /// Remote URI for `path`, or `None` if it was not staged
    fn apply(&self, path: &Path) -> Option<String>;
}

/// Converter for events without staged files: paths become `file://` URIs
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPathConverter;

impl PathConverter for IdentityPathConverter {
    fn apply(&self, path: &Path) -> Option<String> {
        Some(format!("file://{}", path.display()))
    }
}

/// Converter backed by an explicit path -> URI table
#[derive(Debug, Clone, Default)]
pub struct MappedPathConverter {
    uris: HashMap<PathBuf, String>,
}

impl MappedPathConverter {
    pub fn new(uris: HashMap<PathBuf, String>) -> Self {
        MappedPathConverter { uris }
    }
}

impl PathConverter for MappedPathConverter {
    fn apply(&self, path: &Path) -> Option<String> {
        self.uris.get(path).cloned()
    }
}

pub type ConverterResult = Result<Arc<dyn PathConverter>, LocalFileUploadError>;

/// Future returned by a `LocalFileUploader`
pub type UploadFuture = BoxFuture<'static, ConverterResult>;

/// External artifact uploader
///
/// Implementations stage every file in the map and resolve to a converter
/// covering them. Cancellation is best-effort: the coordinator aborts the
/// task polling the future, the underlying I/O may already be done.
pub trait LocalFileUploader: Send + Sync + 'static {
    fn upload(&self, files: BTreeMap<PathBuf, LocalFile>) -> UploadFuture;

    /// Release uploader resources once no more uploads will be started
    fn shutdown(&self) {}
}

/// Starts per-event uploads on the runtime
pub struct LocalFileUploadCoordinator {
    uploader: Arc<dyn LocalFileUploader>,
    runtime: Handle,
}

impl LocalFileUploadCoordinator {
    pub fn new(uploader: Arc<dyn LocalFileUploader>, runtime: Handle) -> Self {
        LocalFileUploadCoordinator { uploader, runtime }
    }

    /// Start staging `files`. Must not be called while holding a lock the
    /// uploader might need: starting an upload may block or log.
    pub fn begin_upload(&self, files: &[LocalFile]) -> LocalFileUpload {
        if files.is_empty() {
            return LocalFileUpload::ready(Arc::new(IdentityPathConverter));
        }

        let mut unique: BTreeMap<PathBuf, LocalFile> = BTreeMap::new();
        for file in files {
            unique
                .entry(file.path.clone())
                .or_insert_with(|| file.clone());
        }
        debug!(
            files = files.len(),
            unique = unique.len(),
            "Starting local file upload"
        );

        let future = self.uploader.upload(unique);
        LocalFileUpload {
            state: UploadState::Running(self.runtime.spawn(future)),
        }
    }

    pub fn shutdown(&self) {
        self.uploader.shutdown();
    }
}

enum UploadState {
    Running(JoinHandle<ConverterResult>),
    Finished(ConverterResult),
}

/// Handle to one event's in-flight (or finished) file upload
pub struct LocalFileUpload {
    state: UploadState,
}

impl LocalFileUpload {
    /// An upload that has already succeeded
    pub fn ready(converter: Arc<dyn PathConverter>) -> Self {
        LocalFileUpload {
            state: UploadState::Finished(Ok(converter)),
        }
    }

    /// Wait for the upload. The result is cached, so a retried event does
    /// not stage its files twice. Cancel-safe.
    pub async fn wait(&mut self) -> ConverterResult {
        let result = match &mut self.state {
            UploadState::Finished(result) => return result.clone(),
            UploadState::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(LocalFileUploadError::cancelled()),
                Err(e) => Err(LocalFileUploadError::new(format!(
                    "local file upload task failed: {}",
                    e
                ))),
            },
        };
        self.state = UploadState::Finished(result.clone());
        result
    }

    /// Abort the upload if it is still running
    pub fn cancel(&self) {
        if let UploadState::Running(handle) = &self.state {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            UploadState::Running(handle) => handle.is_finished(),
            UploadState::Finished(_) => true,
        }
    }
}

impl Drop for LocalFileUpload {
    fn drop(&mut self) {
        if let UploadState::Running(handle) = &self.state {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for LocalFileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            UploadState::Running(_) => "running",
            UploadState::Finished(Ok(_)) => "succeeded",
            UploadState::Finished(Err(_)) => "failed",
        };
        f.debug_struct("LocalFileUpload")
            .field("state", &state)
            .finish()
    }
}

// ============================================================================
// InMemoryFileUploader - For tests and DST
// ============================================================================

#[derive(Default)]
struct InMemoryUploaderState {
    uploaded: Vec<PathBuf>,
    gates: HashMap<PathBuf, watch::Sender<bool>>,
    failures: HashMap<PathBuf, String>,
    latency: Duration,
    upload_calls: usize,
    shut_down: bool,
}

/// In-memory uploader that records what it staged
///
/// Paths can be held back with `block` until `release`, or made to fail.
/// Staged files map to `bytestream://<prefix>/<path>`.
#[derive(Clone)]
pub struct InMemoryFileUploader {
    prefix: String,
    state: Arc<Mutex<InMemoryUploaderState>>,
}

impl Default for InMemoryFileUploader {
    fn default() -> Self {
        Self::new("cas")
    }
}

impl InMemoryFileUploader {
    pub fn new(prefix: impl Into<String>) -> Self {
        InMemoryFileUploader {
            prefix: prefix.into(),
            state: Arc::new(Mutex::new(InMemoryUploaderState::default())),
        }
    }

    /// Delay every upload by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Hold uploads containing `path` until `release` is called
    pub fn block(&self, path: impl Into<PathBuf>) {
        let (tx, _rx) = watch::channel(false);
        self.state.lock().gates.insert(path.into(), tx);
    }

    pub fn release(&self, path: impl AsRef<Path>) {
        if let Some(tx) = self.state.lock().gates.get(path.as_ref()) {
            tx.send_replace(true);
        }
    }

    /// Make uploads containing `path` fail with `message`
    pub fn fail(&self, path: impl Into<PathBuf>, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .insert(path.into(), message.into());
    }

    /// Paths staged so far, in completion order
    pub fn uploaded(&self) -> Vec<PathBuf> {
        self.state.lock().uploaded.clone()
    }

    pub fn upload_calls(&self) -> usize {
        self.state.lock().upload_calls
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    fn uri_for(prefix: &str, path: &Path) -> String {
        let display = path.display().to_string();
        format!("bytestream://{}/{}", prefix, display.trim_start_matches('/'))
    }
}

impl LocalFileUploader for InMemoryFileUploader {
    fn upload(&self, files: BTreeMap<PathBuf, LocalFile>) -> UploadFuture {
        let state = Arc::clone(&self.state);
        let prefix = self.prefix.clone();
        async move {
            let (gates, latency) = {
                let mut st = state.lock();
                st.upload_calls += 1;
                let gates: Vec<watch::Receiver<bool>> = files
                    .keys()
                    .filter_map(|path| st.gates.get(path).map(|tx| tx.subscribe()))
                    .collect();
                (gates, st.latency)
            };

            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            for mut gate in gates {
                let opened = gate.wait_for(|open| *open).await.is_ok();
                if !opened {
                    return Err(LocalFileUploadError::cancelled());
                }
            }

            let mut st = state.lock();
            for path in files.keys() {
                if let Some(message) = st.failures.get(path) {
                    return Err(LocalFileUploadError::with_source(
                        format!("uploading {}", path.display()),
                        std::io::Error::new(std::io::ErrorKind::Other, message.clone()),
                    ));
                }
            }
            let mut uris = HashMap::with_capacity(files.len());
            for path in files.keys() {
                st.uploaded.push(path.clone());
                uris.insert(path.clone(), Self::uri_for(&prefix, path));
            }
            Ok(Arc::new(MappedPathConverter::new(uris)) as Arc<dyn PathConverter>)
        }
        .boxed()
    }

    fn shutdown(&self) {
        self.state.lock().shut_down = true;
    }
}
