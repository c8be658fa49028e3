pub mod catch_up;
pub mod delete;
pub mod download;
pub mod fetch;
pub mod metadata;
pub mod push;
pub mod upload;

pub use catch_up::CatchUpOperation;
pub use delete::{DeleteOperation, DeleteOperationOutcome, DeleteOperationRequest};
pub use download::{
    DownloadOperation, DownloadOperationRequest, DownloadOperationResult, DownloadSource,
};
pub use fetch::FetchOperation;
pub use metadata::MetadataOperation;
pub use push::PushOperation;
pub use upload::{UploadOperation, UploadOperationOutcome, UploadOperationRequest};

/// Totals of one push, catch-up or fetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub owners: usize,
    pub files: usize,
    pub transferred: usize,
    pub failures: usize,
}

impl ReconcileReport {
    pub(crate) fn record<T>(&mut self, result: crate::error::Result<T>, what: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!("{} failed: {}", what, error);
                self.failures += 1;
                None
            }
        }
    }
}

/// Greatest checkpoint position both sides hold, capped at `limit`, or zero.
pub(crate) fn common_start(local: &[u64], remote: &[u64], limit: u64) -> u64 {
    local
        .iter()
        .rev()
        .copied()
        .find(|p| *p <= limit && remote.binary_search(p).is_ok())
        .unwrap_or(0)
}
