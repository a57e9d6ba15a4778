// Downloader module - format resolution, transfer, muxing and the jobs built on them

pub mod clip;
pub mod errors;
pub mod extractors;
pub mod fetcher;
pub mod format_selector;
pub mod job;
pub mod models;
pub mod muxer;
pub mod playlist;
pub mod progress;
pub mod tools;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use clip::ClipJob;
pub use errors::{ErrorKind, JobError, JobFailure};
pub use format_selector::{FormatResolver, Selection};
pub use job::{DownloadJob, DownloadServices, RetryPolicy};
pub use models::{
    ClipRange, ClipResult, EntryUpdate, FormatCatalog, ItemState, MediaItem, RangeRequest, StreamVariant,
};
pub use playlist::{PlaylistCoordinator, PlaylistReport};
pub use progress::{CancelFlag, Reporter};
pub use tools::{ToolManager, Toolchain};
