// yt-clipper command line: a thin collaborator that starts jobs and prints their events

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use yt_clipper_lib::downloader::extractors::{CatalogSource, ExtractorConfig, YtDlpCatalog};
use yt_clipper_lib::downloader::fetcher::FetchBackend;
use yt_clipper_lib::downloader::format_selector::FormatResolver;
use yt_clipper_lib::downloader::{ErrorKind, ItemState, JobFailure, RangeRequest, Toolchain};
use yt_clipper_lib::{init_tracing, BackgroundExecutor, ClipperConfig, EventKind, JobHandle, JobOutcome};

#[derive(Parser)]
#[command(name = "yt-clipper")]
#[command(about = "Download videos, merge split streams and cut clips", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    network: NetworkArgs,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the configured extractor settings
#[derive(Args)]
struct NetworkArgs {
    /// Proxy URL (http, https or socks5)
    #[arg(long, global = true)]
    proxy: Option<String>,
    /// cookies.txt file passed to yt-dlp
    #[arg(long, global = true)]
    cookies: Option<String>,
    /// Browser to read cookies from, e.g. chrome
    #[arg(long, global = true)]
    cookies_from_browser: Option<String>,
    /// Socket timeout in seconds
    #[arg(long, global = true)]
    socket_timeout: Option<u32>,
    /// YouTube player client; repeatable, tried in order
    #[arg(long = "player-client", global = true)]
    player_clients: Vec<String>,
}

impl NetworkArgs {
    fn apply(self, mut extractor: ExtractorConfig) -> ExtractorConfig {
        if self.proxy.is_some() {
            extractor = extractor.with_proxy(self.proxy);
        }
        if self.cookies.is_some() {
            extractor = extractor.with_cookies_path(self.cookies);
        }
        if self.cookies_from_browser.is_some() {
            extractor = extractor.with_cookies_from_browser(self.cookies_from_browser);
        }
        if let Some(seconds) = self.socket_timeout {
            extractor = extractor.with_timeout(seconds);
        }
        if !self.player_clients.is_empty() {
            extractor = extractor.with_player_clients(self.player_clients);
        }
        extractor
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show availability and versions of yt-dlp, ffmpeg and ffprobe
    Tools,
    /// List available formats and the pair that would be downloaded
    Formats { url: String },
    /// Download a video, or every entry of a playlist
    Download {
        url: String,
        #[arg(long)]
        playlist: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Fetch direct-URL streams over plain HTTP instead of yt-dlp
        #[arg(long)]
        http: bool,
        /// Playlist entries downloaded at once
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Cut clips out of a local video file
    Clip {
        source: PathBuf,
        /// Clip range as START-END (HH:MM:SS, MM:SS or seconds); repeatable
        #[arg(short, long = "range", required = true)]
        ranges: Vec<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Delete the source once every range has been attempted
        #[arg(long)]
        delete_source: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ClipperConfig::load(path)?,
        None => ClipperConfig::default(),
    }
    .apply_env();
    let extractor = cli.network.apply(config.extractor.clone());
    let mut config = config.with_extractor(extractor);

    match cli.command {
        Command::Tools => {
            config.validate().context("Invalid configuration")?;
            show_tools(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Formats { url } => {
            config.validate().context("Invalid configuration")?;
            show_formats(&config, &url).await
        }
        Command::Download {
            url,
            playlist,
            output,
            http,
            jobs,
        } => {
            if let Some(output) = output {
                config = config.with_download_dir(output);
            }
            if http {
                config = config.with_fetch_backend(FetchBackend::Http);
            }
            if let Some(jobs) = jobs {
                config = config.with_playlist_concurrency(jobs);
            }
            config.validate().context("Invalid configuration")?;

            let executor = executor(&config).await?;
            let output = config.download_dir.clone();
            let handle = if playlist {
                executor.spawn_playlist(url, output)
            } else {
                executor.spawn_download(url, output)
            };
            Ok(report(follow(handle).await))
        }
        Command::Clip {
            source,
            ranges,
            output,
            delete_source,
        } => {
            if let Some(output) = output {
                config = config.with_clips_dir(output);
            }
            config.validate().context("Invalid configuration")?;

            // each range is parsed by the job, so a bad one only fails itself
            let ranges = ranges.into_iter().map(RangeRequest::from);
            let executor = executor(&config).await?;
            let handle =
                executor.spawn_clips(source, ranges, config.clips_dir.clone(), delete_source);
            Ok(report(follow(handle).await))
        }
    }
}

async fn show_tools(config: &ClipperConfig) -> Result<()> {
    for tool in config.tool_manager().get_all_tools_async().await? {
        let path = tool
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        match (&tool.version, tool.is_available) {
            (Some(version), true) => println!("{:<8} {:<20} {}", tool.name, version, path),
            _ => println!("{:<8} {:<20} {}", tool.name, "missing", path),
        }
    }
    Ok(())
}

async fn show_formats(config: &ClipperConfig, url: &str) -> Result<ExitCode> {
    let tools = Toolchain::discover_async(config.tool_manager()).await?;
    let catalog = YtDlpCatalog::new(tools.ytdlp, config.extractor.clone())
        .fetch_catalog(url)
        .await?;

    println!("{}", catalog.title);
    for variant in &catalog.variants {
        let label = if variant.height.is_some() {
            FormatResolver::video_label(variant)
        } else {
            FormatResolver::audio_label(variant)
        };
        let size = FormatResolver::format_size(variant.effective_size()).unwrap_or_default();
        println!(
            "  {:<8} {:<12} {:<5} {:<24} {}",
            variant.id,
            format!("{:?}", variant.kind),
            variant.ext,
            label,
            size
        );
    }

    match FormatResolver::resolve(&catalog) {
        Ok(selection) => {
            println!("Selected: {}", selection.describe());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn executor(config: &ClipperConfig) -> Result<BackgroundExecutor> {
    let tools = Toolchain::discover_async(config.tool_manager()).await?;
    let services = config.build_services(&tools)?;
    Ok(BackgroundExecutor::new(std::sync::Arc::new(services))
        .with_playlist_concurrency(config.playlist_concurrency))
}

/// Print events until the terminal one; Ctrl-C requests cancellation
async fn follow(mut handle: JobHandle) -> JobOutcome {
    let cancel = handle.canceller();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;
    let mut shown_percent = None;

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else {
                    return JobOutcome::Failed(JobFailure {
                        kind: ErrorKind::Io,
                        message: "Job ended without a result".to_string(),
                        detail: None,
                    });
                };
                match event.kind {
                    EventKind::Progress { fraction } => {
                        let percent = (fraction * 100.0).floor() as u32;
                        if shown_percent != Some(percent) {
                            shown_percent = Some(percent);
                            eprintln!("  {:>3}%", percent);
                        }
                    }
                    EventKind::Status { message } => println!("{}", message),
                    EventKind::Entry(update) => {
                        if update.state.is_terminal() {
                            let title = update.title.as_deref().unwrap_or("untitled");
                            match (&update.state, &update.error) {
                                (ItemState::Failed, Some(error)) => println!(
                                    "  #{} {}: failed ({}: {})",
                                    update.position, title, error.kind.as_str(), error.message
                                ),
                                (state, _) => println!("  #{} {}: {}", update.position, title, state),
                            }
                        }
                    }
                    EventKind::Terminal { outcome } => return outcome,
                }
            }
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                eprintln!("Cancelling, waiting for cleanup...");
                cancel.cancel();
            }
        }
    }
}

fn report(outcome: JobOutcome) -> ExitCode {
    match &outcome {
        JobOutcome::Downloaded(path) => println!("Saved {}", path.display()),
        JobOutcome::Playlist(report) => println!(
            "Playlist done: {} downloaded, {} failed",
            report.succeeded(),
            report.failed()
        ),
        JobOutcome::Clips(results) => {
            for result in results {
                if result.success {
                    println!("  clip {}: {}", result.index, result.output_path.display());
                } else if let Some(error) = &result.error {
                    println!(
                        "  clip {}: failed ({}: {})",
                        result.index,
                        error.kind.as_str(),
                        error.message
                    );
                }
            }
        }
        JobOutcome::Failed(failure) => {
            eprintln!("Failed ({}): {}", failure.kind.as_str(), failure.message);
            if let Some(detail) = &failure.detail {
                tracing::debug!("failure detail: {}", detail);
            }
        }
        JobOutcome::Cancelled => eprintln!("Cancelled"),
    }

    if outcome.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
