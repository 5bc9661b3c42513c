//! Turns a finished download into something the browser can save.

use std::io;
use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::FileFormat;
use crate::invoker::DownloadResult;

pub const SUCCESS_MESSAGE: &str = "Data downloaded successfully!";
pub const FAILURE_PREFIX: &str = "Error downloading data: ";

/// Characters left alone in a single URL path segment or an RFC 5987 value.
const NAME_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("downloader reported success but {0} does not exist")]
    Missing(PathBuf),
    #[error("not a downloadable file name: {0}")]
    InvalidName(String),
    #[error("failed to read artifact: {0}")]
    Io(#[from] io::Error),
}

/// Size in mebibytes with two decimals, e.g. `12.34 MB`.
pub fn size_label(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// A produced file ready to be offered for download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Button text: `<file> (<size>)`.
    pub label: String,
    pub mime: String,
    pub url: String,
}

impl Artifact {
    /// Look up the file a successful run should have written.
    pub fn from_result(result: &DownloadResult) -> Result<Self, ArtifactError> {
        Self::open(&result.output_file, result.file_format)
    }

    pub fn open(path: &Path, format: FileFormat) -> Result<Self, ArtifactError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ArtifactError::Missing(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ArtifactError::Missing(path.to_path_buf())),
            Err(e) => return Err(e.into()),
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArtifactError::InvalidName(path.display().to_string()))?
            .to_string();

        Ok(Self {
            label: format!("{file_name} ({})", size_label(metadata.len())),
            url: format!("/artifacts/{}", utf8_percent_encode(&file_name, NAME_SAFE)),
            mime: format.mime(),
            size_bytes: metadata.len(),
            path: path.to_path_buf(),
            file_name,
        })
    }

    /// `Content-Disposition` value offering the file as an attachment.
    ///
    /// `filename` carries a plain ASCII fallback, `filename*` the exact name.
    pub fn content_disposition(&self) -> String {
        let fallback: String = self
            .file_name
            .chars()
            .map(|c| match c {
                '"' | '\\' => '_',
                c if c.is_ascii_graphic() || c == ' ' => c,
                _ => '_',
            })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(&self.file_name, NAME_SAFE)
        )
    }
}

/// Resolve a requested artifact name inside `output_dir`.
///
/// Only bare file names whose extension is one of the offered formats are served.
pub fn locate(output_dir: &Path, name: &str) -> Result<Artifact, ArtifactError> {
    let invalid = || ArtifactError::InvalidName(name.to_string());
    let candidate = Path::new(name);
    if candidate.file_name().and_then(|n| n.to_str()) != Some(name) || name.starts_with('.') {
        return Err(invalid());
    }
    let format: FileFormat = candidate
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;
    Artifact::open(&output_dir.join(name), format)
}

/// What the form shows once the downloader is done.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Presentation {
    Succeeded { message: String, artifact: Artifact },
    Failed { message: String },
}

pub fn present(result: &DownloadResult) -> Presentation {
    if !result.succeeded() {
        return Presentation::Failed {
            message: format!("{FAILURE_PREFIX}{}", result.stderr_text),
        };
    }
    match Artifact::from_result(result) {
        Ok(artifact) => {
            info!(file = %artifact.file_name, size = artifact.size_bytes, "artifact ready");
            Presentation::Succeeded {
                message: SUCCESS_MESSAGE.to_string(),
                artifact,
            }
        }
        Err(e) => {
            warn!(%e, "artifact unavailable");
            Presentation::Failed {
                message: format!("{FAILURE_PREFIX}{e}"),
            }
        }
    }
}
