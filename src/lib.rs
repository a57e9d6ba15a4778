// yt-clipper library: download pipeline, clip extraction and the background executor

pub mod config;
pub mod downloader;
pub mod executor;

use tracing_subscriber::EnvFilter;

pub use config::ClipperConfig;
pub use executor::{BackgroundExecutor, EventKind, JobEvent, JobHandle, JobId, JobOutcome};

/// Install the console subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbosity` picks warn, info, debug or trace.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
