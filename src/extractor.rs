//! Adapter around the external extraction engine (yt-dlp).
//!
//! The handlers only see [`MediaExtractor`]; the engine's failures come back
//! as an explicit [`ExtractionError`] tag instead of being inspected by type.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn format_selector(self) -> &'static str {
        match self {
            Self::Video => "best[ext=mp4]/best",
            Self::Audio => "bestaudio/best",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOptions {
    pub format: &'static str,
    /// `<download dir>/<file id>.%(ext)s`
    pub output_template: String,
    pub cookie_file: Option<PathBuf>,
    download_dir: PathBuf,
    file_id: String,
}

impl ExtractionOptions {
    pub fn new(media_type: MediaType, download_dir: &Path, file_id: &str) -> Self {
        Self {
            format: media_type.format_selector(),
            output_template: format!("{}/{file_id}.%(ext)s", download_dir.to_string_lossy()),
            cookie_file: None,
            download_dir: download_dir.to_path_buf(),
            file_id: file_id.to_string(),
        }
    }

    pub fn with_cookie_file(mut self, cookie_file: PathBuf) -> Self {
        self.cookie_file = Some(cookie_file);
        self
    }

    /// Where the engine puts the file once it has picked `ext`.
    pub fn output_path(&self, ext: &str) -> PathBuf {
        self.download_dir.join(format!("{}.{ext}", self.file_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMedia {
    pub title: Option<String>,
    pub ext: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// The engine ran and refused or failed: unsupported site, login
    /// required, geo-block, network failure mid-download.
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Unknown(String),
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractionOptions,
    ) -> Result<ExtractedMedia, ExtractionError>;
}

pub struct YtDlpExtractor {
    program: String,
    leading_args: Vec<String>,
    timeout: Option<Duration>,
}

impl YtDlpExtractor {
    pub fn new(command: &[String], timeout: Option<Duration>) -> Self {
        let (program, leading_args) = match command.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => ("yt-dlp".to_string(), Vec::new()),
        };

        Self {
            program,
            leading_args,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrintedInfo {
    title: Option<String>,
    filepath: Option<String>,
    ext: Option<String>,
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractionOptions,
    ) -> Result<ExtractedMedia, ExtractionError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(build_args(url, options))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running {} for {url}", self.program);
        let output_future = command.output();
        let output = match self.timeout {
            Some(limit) => timeout(limit, output_future).await.map_err(|_| {
                ExtractionError::Failed(format!(
                    "extraction timed out after {} seconds",
                    limit.as_secs()
                ))
            })?,
            None => output_future.await,
        }
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::Unknown(format!(
                    "{} is not installed or not on PATH",
                    self.program
                ))
            } else {
                ExtractionError::Unknown(format!("could not run {}: {error}", self.program))
            }
        })?;

        if !output.status.success() {
            return Err(ExtractionError::Failed(run_error_message(&output.stderr)));
        }

        let media = parse_printed_info(&output.stdout)?;
        info!("Extracted {url} as .{}", media.ext);
        Ok(media)
    }
}

fn build_args(url: &str, options: &ExtractionOptions) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-f".to_string(),
        options.format.to_string(),
        "-o".to_string(),
        options.output_template.clone(),
    ];

    if let Some(cookie_file) = &options.cookie_file {
        args.push("--cookies".to_string());
        args.push(cookie_file.to_string_lossy().into_owned());
    }

    args.push("--print".to_string());
    args.push("after_move:%(.{title,filepath,ext})j".to_string());
    args.push(url.to_string());
    args
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp exited without an error message")
        .to_string()
}

fn parse_printed_info(stdout: &[u8]) -> Result<ExtractedMedia, ExtractionError> {
    let stdout = String::from_utf8_lossy(stdout);
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .ok_or_else(|| {
            ExtractionError::Unknown("yt-dlp did not report the downloaded file".to_string())
        })?;

    let printed: PrintedInfo = serde_json::from_str(line).map_err(|error| {
        ExtractionError::Unknown(format!("could not read yt-dlp output: {error}"))
    })?;

    let ext = printed
        .filepath
        .as_deref()
        .and_then(|path| Path::new(path).extension())
        .and_then(|ext| ext.to_str())
        .map(ToString::to_string)
        .or(printed.ext)
        .ok_or_else(|| {
            ExtractionError::Unknown("yt-dlp did not report a file extension".to_string())
        })?;

    Ok(ExtractedMedia {
        title: printed.title,
        ext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_accepts_only_video_and_audio() {
        assert_eq!(MediaType::parse("video"), Some(MediaType::Video));
        assert_eq!(MediaType::parse("audio"), Some(MediaType::Audio));
        assert_eq!(MediaType::parse("Video"), None);
        assert_eq!(MediaType::parse("image"), None);
        assert_eq!(MediaType::parse(""), None);
    }

    #[test]
    fn options_use_type_specific_format_selector() {
        let dir = Path::new("downloads");
        let video = ExtractionOptions::new(MediaType::Video, dir, "abc123");
        let audio = ExtractionOptions::new(MediaType::Audio, dir, "abc123");

        assert_eq!(video.format, "best[ext=mp4]/best");
        assert_eq!(audio.format, "bestaudio/best");
        assert_eq!(video.output_template, "downloads/abc123.%(ext)s");
        assert_eq!(video.output_path("mp4"), PathBuf::from("downloads/abc123.mp4"));
    }

    #[test]
    fn cookie_file_is_passed_only_when_attached() {
        let options = ExtractionOptions::new(MediaType::Audio, Path::new("downloads"), "id");
        let args = build_args("https://example.com/v", &options);
        assert!(!args.contains(&"--cookies".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));

        let options = options.with_cookie_file(PathBuf::from("cookies.txt"));
        let args = build_args("https://example.com/v", &options);
        let position = args.iter().position(|arg| arg == "--cookies").unwrap();
        assert_eq!(args[position + 1], "cookies.txt");
    }

    #[test]
    fn printed_filepath_extension_wins_over_ext_field() {
        let stdout = br#"[download] 100%
{"title": "T", "filepath": "downloads/abc.mkv", "ext": "webm"}
"#;
        let media = parse_printed_info(stdout).unwrap();
        assert_eq!(media.title.as_deref(), Some("T"));
        assert_eq!(media.ext, "mkv");
    }

    #[test]
    fn missing_output_is_an_unknown_failure() {
        assert!(matches!(
            parse_printed_info(b"\n\n"),
            Err(ExtractionError::Unknown(_))
        ));
        assert!(matches!(
            parse_printed_info(b"not json"),
            Err(ExtractionError::Unknown(_))
        ));
    }

    #[test]
    fn error_message_is_last_stderr_line() {
        let stderr = b"WARNING: something\nERROR: [generic] Unsupported URL: https://x\n\n";
        assert_eq!(
            run_error_message(stderr),
            "ERROR: [generic] Unsupported URL: https://x"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_an_unknown_failure() {
        let extractor = YtDlpExtractor::new(&["definitely-not-a-real-yt-dlp".to_string()], None);
        let options = ExtractionOptions::new(MediaType::Video, Path::new("downloads"), "id");

        let result = extractor.extract("https://example.com/v", &options).await;
        assert!(matches!(result, Err(ExtractionError::Unknown(_))));
    }

    #[cfg(unix)]
    mod script {
        use super::*;

        fn sh_extractor(dir: &Path, body: &str, timeout: Option<Duration>) -> YtDlpExtractor {
            let script = dir.join("fake-yt-dlp.sh");
            std::fs::write(&script, body).unwrap();
            YtDlpExtractor::new(
                &["sh".to_string(), script.to_string_lossy().into_owned()],
                timeout,
            )
        }

        #[tokio::test]
        async fn non_zero_exit_is_an_extraction_failure() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = sh_extractor(
                dir.path(),
                "echo 'ERROR: Sign in to confirm your age' >&2\nexit 1\n",
                None,
            );
            let options = ExtractionOptions::new(MediaType::Video, dir.path(), "id");

            let result = extractor.extract("https://example.com/v", &options).await;
            assert_eq!(
                result,
                Err(ExtractionError::Failed(
                    "ERROR: Sign in to confirm your age".to_string()
                ))
            );
        }

        #[tokio::test]
        async fn successful_run_reports_title_and_extension() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = sh_extractor(
                dir.path(),
                "printf '%s\\n' '{\"title\": \"Clip\", \"filepath\": \"x/id.m4a\", \"ext\": \"m4a\"}'\n",
                None,
            );
            let options = ExtractionOptions::new(MediaType::Audio, dir.path(), "id");

            let media = extractor
                .extract("https://example.com/v", &options)
                .await
                .unwrap();
            assert_eq!(
                media,
                ExtractedMedia {
                    title: Some("Clip".to_string()),
                    ext: "m4a".to_string(),
                }
            );
        }

        #[tokio::test]
        async fn slow_engine_times_out_when_limit_is_set() {
            let dir = tempfile::tempdir().unwrap();
            let extractor = sh_extractor(
                dir.path(),
                "sleep 5\n",
                Some(Duration::from_millis(200)),
            );
            let options = ExtractionOptions::new(MediaType::Video, dir.path(), "id");

            let result = extractor.extract("https://example.com/v", &options).await;
            assert!(matches!(result, Err(ExtractionError::Failed(_))));
        }
    }
}
