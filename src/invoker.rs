//! Runs the external `overturemaps` downloader.
//!
//! [`Invoker::run`] blocks the calling thread until the child exits. Standard
//! output is forwarded line by line as it arrives, standard error is collected
//! in full and only looked at when the exit code is non-zero.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::bbox::BoundingBox;
use crate::catalog::{source_url, Category, FileFormat};
use crate::config::{AppConfig, OutputNaming};
use crate::panel::PanelState;

/// How often the relay loop checks for cancellation while the child is quiet.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Everything the downloader needs, frozen at the moment the user clicks download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub category: Category,
    pub theme: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub file_format: FileFormat,
    pub bbox: BoundingBox,
}

impl DownloadRequest {
    pub fn new(panel: PanelState, bbox: BoundingBox) -> Self {
        Self {
            category: panel.category,
            theme: panel.theme,
            kind: panel.kind,
            version: panel.version,
            file_format: panel.file_format,
            bbox,
        }
    }

    pub fn source_url(&self) -> String {
        source_url(&self.version, &self.theme, &self.kind)
    }

    /// Arguments after the program name, in the order the downloader expects.
    pub fn args(&self, output: &Path) -> Vec<OsString> {
        vec![
            "download".into(),
            "-f".into(),
            self.file_format.as_str().into(),
            "--bbox".into(),
            self.bbox.to_arg().into(),
            "-o".into(),
            output.as_os_str().to_owned(),
            "-r".into(),
            self.version.clone().into(),
            "-cth".into(),
            self.theme.clone().into(),
            "-cty".into(),
            self.kind.clone().into(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("lost contact with the downloader: {0}")]
    Io(#[from] io::Error),
    #[error("download cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between the relay and whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the child left behind once it exited.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_text: String,
    pub output_file: PathBuf,
    pub file_format: FileFormat,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl DownloadResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct Invoker {
    downloader: PathBuf,
    output_dir: PathBuf,
    naming: OutputNaming,
}

impl Invoker {
    pub fn new(downloader: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, naming: OutputNaming) -> Self {
        Self {
            downloader: downloader.into(),
            output_dir: output_dir.into(),
            naming,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.downloader, &config.output_dir, config.naming)
    }

    pub fn output_path(&self, request: &DownloadRequest) -> PathBuf {
        self.output_dir
            .join(self.naming.file_name(&request.theme, &request.kind, request.file_format))
    }

    pub fn command(&self, request: &DownloadRequest) -> Command {
        let mut cmd = Command::new(&self.downloader);
        cmd.args(request.args(&self.output_path(request)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Printable form of the command line, for the log and the UI.
    pub fn command_line(&self, request: &DownloadRequest) -> String {
        std::iter::once(self.downloader.as_os_str().to_owned())
            .chain(request.args(&self.output_path(request)))
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the downloader to completion, handing every stdout line to `on_line`.
    #[instrument(skip_all, fields(category = %request.category, format = %request.file_format))]
    pub fn run(
        &self,
        request: &DownloadRequest,
        cancel: &CancelToken,
        mut on_line: impl FnMut(&str),
    ) -> Result<DownloadResult, InvokeError> {
        let output_file = self.output_path(request);
        info!(command = %self.command_line(request), "starting downloader");

        let started_at = Local::now();
        let mut child = self.command(request).spawn().map_err(|source| InvokeError::Spawn {
            program: self.downloader.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| io::Error::other("stdout was not captured"))?;
        let stderr = child.stderr.take().ok_or_else(|| io::Error::other("stderr was not captured"))?;

        // stderr is drained on its own thread so a chatty child can't fill the pipe and stall
        let stderr_handle = thread::spawn(move || {
            let mut text = String::new();
            let mut bytes = Vec::new();
            if BufReader::new(stderr).read_to_end(&mut bytes).is_ok() {
                text = String::from_utf8_lossy(&bytes).into_owned();
            }
            text
        });

        let (tx, rx) = mpsc::channel::<String>();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim().to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%e, "stdout read failed");
                        break;
                    }
                }
            }
        });

        let mut stdout_lines = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(abort(&mut child));
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    debug!(target: "overture_downloader::relay", "{line}");
                    on_line(&line);
                    stdout_lines.push(line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // stdout can close well before the child exits
        let status = loop {
            if cancel.is_cancelled() {
                return Err(abort(&mut child));
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            thread::sleep(CANCEL_POLL);
        };
        let stderr_text = stderr_handle.join().unwrap_or_default();
        let finished_at = Local::now();

        let result = DownloadResult {
            exit_code: status.code(),
            stdout_lines,
            stderr_text,
            output_file,
            file_format: request.file_format,
            started_at,
            finished_at,
        };

        if result.succeeded() {
            info!(
                elapsed_ms = (finished_at - started_at).num_milliseconds(),
                output = %result.output_file.display(),
                "downloader finished"
            );
        } else {
            warn!(exit_code = ?result.exit_code, stderr = %result.stderr_text, "downloader failed");
        }

        Ok(result)
    }
}

fn abort(child: &mut Child) -> InvokeError {
    info!("cancelling downloader");
    if let Err(e) = child.kill() {
        warn!(%e, "failed to kill downloader");
    }
    if let Err(e) = child.wait() {
        warn!(%e, "failed to reap downloader");
    }
    InvokeError::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DownloadRequest {
        DownloadRequest::new(
            PanelState::default().with_category(Category::Building),
            BoundingBox {
                min_x: -74.02,
                min_y: 40.68,
                max_x: -73.9,
                max_y: 40.8,
            },
        )
    }

    #[test]
    fn test_request_from_panel() {
        let request = request();
        assert_eq!(request.theme, "buildings");
        assert_eq!(request.kind, "building");
        assert_eq!(request.file_format, FileFormat::Geojson);
        assert_eq!(
            request.source_url(),
            "overturemaps-us-west-2/release/2024-05-16-beta.0/theme=buildings/type=building/"
        );
    }

    #[test]
    fn test_command_arguments() {
        let invoker = Invoker::new("overturemaps", "/data", OutputNaming::Qualified);
        let request = request();
        let args: Vec<String> = request
            .args(&invoker.output_path(&request))
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "download",
                "-f",
                "geojson",
                "--bbox",
                "-74.02,40.68,-73.9,40.8",
                "-o",
                "/data/output_buildings_building.geojson",
                "-r",
                "2024-05-16-beta.0",
                "-cth",
                "buildings",
                "-cty",
                "building",
            ]
        );
    }

    #[test]
    fn test_bbox_argument_is_four_numbers_in_order() {
        let request = request();
        let args = request.args(Path::new("out"));
        let position = args.iter().position(|a| a == "--bbox").unwrap();
        let fields: Vec<f64> = args[position + 1]
            .to_str()
            .unwrap()
            .split(',')
            .map(|f| f.parse().unwrap())
            .collect();
        assert_eq!(fields, vec![request.bbox.min_x, request.bbox.min_y, request.bbox.max_x, request.bbox.max_y]);
    }

    #[test]
    fn test_fixed_naming() {
        let invoker = Invoker::new("overturemaps", "out", OutputNaming::Fixed);
        assert_eq!(invoker.output_path(&request()), PathBuf::from("out/output.geojson"));
    }

    #[test]
    fn test_request_json_shape() {
        let json = r#"{
            "category": "segment",
            "theme": "transportation",
            "type": "segment",
            "version": "2024-05-16-beta.0",
            "file_format": "geoparquet",
            "bbox": {"min_x": 1.0, "min_y": 2.0, "max_x": 3.0, "max_y": 4.0}
        }"#;
        let request: DownloadRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.kind, "segment");
        assert_eq!(request.bbox.to_arg(), "1,2,3,4");
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Invoker::new(dir.path().join("no-such-downloader"), dir.path(), OutputNaming::Qualified);
        let result = invoker.run(&request(), &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(InvokeError::Spawn { .. })));
    }

    #[cfg(unix)]
    mod fake_downloader {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        use super::*;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-overturemaps");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn test_success_relays_lines_in_order() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                r#"echo "fetching $5"
echo ""
echo "writing $7"
printf 'data' > "$7""#,
            );
            let invoker = Invoker::new(bin, dir.path(), OutputNaming::Qualified);

            let mut relayed = Vec::new();
            let result = invoker
                .run(&request(), &CancelToken::new(), |line| relayed.push(line.to_string()))
                .unwrap();

            assert!(result.succeeded());
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(relayed, result.stdout_lines);
            assert_eq!(relayed[0], "fetching -74.02,40.68,-73.9,40.8");
            assert_eq!(relayed.len(), 2);
            assert!(result.output_file.ends_with("output_buildings_building.geojson"));
            assert_eq!(fs::read(&result.output_file).unwrap(), b"data");
        }

        #[test]
        fn test_failure_keeps_stderr_verbatim() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "echo 'partial progress'\necho 'Error: release not found' >&2\nexit 1");
            let invoker = Invoker::new(bin, dir.path(), OutputNaming::Qualified);

            let result = invoker.run(&request(), &CancelToken::new(), |_| {}).unwrap();

            assert!(!result.succeeded());
            assert_eq!(result.exit_code, Some(1));
            assert_eq!(result.stderr_text, "Error: release not found\n");
            assert_eq!(result.stdout_lines, vec!["partial progress"]);
        }

        #[test]
        fn test_stdout_and_stderr_are_not_merged() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "echo out\necho err >&2");
            let invoker = Invoker::new(bin, dir.path(), OutputNaming::Qualified);

            let result = invoker.run(&request(), &CancelToken::new(), |_| {}).unwrap();

            assert_eq!(result.stdout_lines, vec!["out"]);
            assert_eq!(result.stderr_text.trim(), "err");
        }

        #[test]
        fn test_cancel_kills_child() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "echo started\nexec sleep 30");
            let invoker = Invoker::new(bin, dir.path(), OutputNaming::Qualified);

            let token = CancelToken::new();
            let canceller = token.clone();
            let started = Instant::now();
            let result = invoker.run(&request(), &token, move |line| {
                if line == "started" {
                    canceller.cancel();
                }
            });

            assert!(matches!(result, Err(InvokeError::Cancelled)));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn test_cancel_after_stdout_closed() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "echo started\nexec >&-\nexec sleep 30");
            let invoker = Invoker::new(bin, dir.path(), OutputNaming::Qualified);

            let token = CancelToken::new();
            let canceller = token.clone();
            let timer = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                canceller.cancel();
            });

            let started = Instant::now();
            let mut relayed = Vec::new();
            let result = invoker.run(&request(), &token, |line| relayed.push(line.to_string()));
            timer.join().unwrap();

            assert!(matches!(result, Err(InvokeError::Cancelled)));
            assert_eq!(relayed, vec!["started"]);
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }
}
