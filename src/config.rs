use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::catalog::{FileFormat, DEFAULT_RELEASE};

/// How the downloader's output file is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputNaming {
    /// `output_<theme>_<type>.<format>`
    #[default]
    Qualified,
    /// `output.<format>`, overwritten by every download
    Fixed,
}

impl OutputNaming {
    pub fn file_name(&self, theme: &str, kind: &str, format: FileFormat) -> String {
        match self {
            Self::Qualified => format!("output_{theme}_{kind}.{format}"),
            Self::Fixed => format!("output.{format}"),
        }
    }
}

/// Runtime settings shared by the server and the download invoker.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    /// Downloader executable, looked up on `PATH` when not absolute.
    pub downloader: PathBuf,
    /// Directory the downloader writes into and artifacts are served from.
    pub output_dir: PathBuf,
    pub naming: OutputNaming,
    pub default_release: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8501)),
            downloader: PathBuf::from("overturemaps"),
            output_dir: PathBuf::from("."),
            naming: OutputNaming::default(),
            default_release: DEFAULT_RELEASE.to_string(),
        }
    }
}
