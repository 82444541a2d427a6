use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a single load request produced no image.
///
/// These never cross the worker/owner boundary as panics or early returns:
/// workers wrap them in a [`crate::loader::Completion`] and the owner turns
/// them into an entry state transition.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{}: cannot decode: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{}: source unavailable: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{uri}: fetch failed: {reason}")]
    NetworkFetch { uri: String, reason: String },
}

impl LoadError {
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            LoadError::SourceUnavailable { .. } | LoadError::NetworkFetch { .. }
        )
    }

    /// `image` reports missing files as `ImageError::IoError`; fold those
    /// into `SourceUnavailable` so callers see one taxonomy.
    pub(crate) fn from_image(path: PathBuf, err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(source) => LoadError::SourceUnavailable { path, source },
            source => LoadError::Decode { path, source },
        }
    }
}

/// Returned by [`crate::queue::WorkQueue::push`] once shutdown has begun.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue has been aborted")]
pub struct QueueAborted;
