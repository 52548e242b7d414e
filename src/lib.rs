pub mod io;
pub mod observability;
pub mod upload;

pub use upload::{
    BuildEvent, BuildEventUploader, BuildStatus, CompletionSignal, FailureKind, UploadError,
    UploaderConfig,
};
