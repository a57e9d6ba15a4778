// Catalog extraction - format lookups, playlist listings, failure diagnostics
//
// `CatalogSource` is the seam jobs depend on; `YtDlpCatalog` is the
// production implementation backed by the yt-dlp binary.

mod cli;
pub mod diagnostics;
mod traits;

pub use cli::YtDlpCatalog;
pub use diagnostics::{analyze_error, diagnose_error, Diagnostics, FailureReason};
pub use traits::{CatalogSource, ExtractorConfig, PlaylistListing};
