// External tool discovery: yt-dlp, ffmpeg, ffprobe

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::errors::JobError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolType {
    YtDlp,
    Ffmpeg,
    Ffprobe,
}

impl ToolType {
    pub const ALL: [ToolType; 3] = [ToolType::YtDlp, ToolType::Ffmpeg, ToolType::Ffprobe];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "yt-dlp",
            ToolType::Ffmpeg => "ffmpeg",
            ToolType::Ffprobe => "ffprobe",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "--version",
            // ffmpeg family uses a single dash
            ToolType::Ffmpeg | ToolType::Ffprobe => "-version",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub tool_type: ToolType,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub is_available: bool,
}

/// Paths the pipeline runs. Only constructed once every tool is present.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Toolchain {
    /// Fails with `DependencyMissing` naming every absent tool.
    pub fn discover(manager: &ToolManager) -> Result<Self, JobError> {
        let infos = manager.get_all_tools();
        let missing: Vec<&str> = infos
            .iter()
            .filter(|info| !info.is_available)
            .map(|info| info.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(JobError::DependencyMissing(missing.join(", ")));
        }

        let path_of = |tool: ToolType| -> Result<PathBuf, JobError> {
            infos
                .iter()
                .find(|info| info.tool_type == tool)
                .and_then(|info| info.path.clone())
                .ok_or_else(|| JobError::DependencyMissing(tool.as_str().to_string()))
        };

        let toolchain = Self {
            ytdlp: path_of(ToolType::YtDlp)?,
            ffmpeg: path_of(ToolType::Ffmpeg)?,
            ffprobe: path_of(ToolType::Ffprobe)?,
        };
        tracing::info!(
            "[Tools] yt-dlp={} ffmpeg={} ffprobe={}",
            toolchain.ytdlp.display(),
            toolchain.ffmpeg.display(),
            toolchain.ffprobe.display()
        );
        Ok(toolchain)
    }

    /// [`Toolchain::discover`] on the blocking pool; lookups spawn processes
    pub async fn discover_async(manager: ToolManager) -> Result<Self, JobError> {
        tokio::task::spawn_blocking(move || Self::discover(&manager))
            .await
            .map_err(|e| JobError::Io(format!("Tool discovery task failed: {}", e)))?
    }
}

/// Locates tools: explicit override, then common install paths, then PATH.
#[derive(Debug, Clone, Default)]
pub struct ToolManager {
    overrides: Vec<(ToolType, PathBuf)>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, tool: ToolType, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.overrides.push((tool, path));
        }
        self
    }

    pub fn get_tool_info(&self, tool_type: ToolType) -> ToolInfo {
        let path = self.detect_tool(tool_type);
        let version = path.as_deref().and_then(|p| Self::get_version(p, tool_type));

        ToolInfo {
            name: tool_type.as_str().to_string(),
            tool_type,
            // a binary that cannot report its version is not usable
            is_available: version.is_some(),
            version,
            path,
        }
    }

    pub fn get_all_tools(&self) -> Vec<ToolInfo> {
        ToolType::ALL
            .iter()
            .map(|tool| self.get_tool_info(*tool))
            .collect()
    }

    pub async fn get_all_tools_async(self) -> Result<Vec<ToolInfo>, JobError> {
        tokio::task::spawn_blocking(move || self.get_all_tools())
            .await
            .map_err(|e| JobError::Io(format!("Tool discovery task failed: {}", e)))
    }

    fn detect_tool(&self, tool_type: ToolType) -> Option<PathBuf> {
        if let Some((_, path)) = self.overrides.iter().find(|(t, _)| *t == tool_type) {
            return Some(path.clone());
        }

        let binary_name = tool_type.as_str();

        // 1. Try common paths first
        let common_paths = [
            format!("/opt/homebrew/bin/{}", binary_name),
            format!("/usr/local/bin/{}", binary_name),
            format!("/usr/bin/{}", binary_name),
        ];

        for path in common_paths {
            if Path::new(&path).exists() {
                return Some(PathBuf::from(path));
            }
        }

        // 2. Try PATH
        let finder = if cfg!(windows) { "where" } else { "which" };
        if let Ok(output) = Command::new(finder).arg(binary_name).output() {
            if output.status.success() {
                let found = String::from_utf8_lossy(&output.stdout);
                if let Some(first) = found.lines().map(str::trim).find(|l| !l.is_empty()) {
                    return Some(PathBuf::from(first));
                }
            }
        }

        None
    }

    fn get_version(path: &Path, tool_type: ToolType) -> Option<String> {
        match Command::new(path).arg(tool_type.version_arg()).output() {
            Ok(output) if output.status.success() => {
                let out = String::from_utf8_lossy(&output.stdout);
                // ffmpeg prints a banner; the first line carries the version
                out.lines().next().map(|l| l.trim().to_string())
            }
            _ => None,
        }
    }
}
