use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Deserializer, de};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RemoteSettings;

pub const API_KEY_HEADER: &str = "X-API-Key";
const PROGRESS_WIDTH: usize = 50;
const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStage {
    Trigger,
    Download,
    Script,
}

impl fmt::Display for RemoteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trigger => "trigger",
            Self::Download => "download",
            Self::Script => "permission script",
        })
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{stage} request to {url} timed out after {seconds}s")]
    Timeout {
        stage: RemoteStage,
        url: String,
        seconds: u64,
    },
    #[error("{stage} request to {url} failed with HTTP {status}")]
    HttpStatus {
        stage: RemoteStage,
        url: String,
        status: u16,
    },
    #[error("{stage} response could not be decoded: {reason}")]
    Decode { stage: RemoteStage, reason: String },
    #[error("source refused to create a backup: {message}")]
    Rejected { message: String },
    #[error("{stage} request to {url} failed: {reason}")]
    Transport {
        stage: RemoteStage,
        url: String,
        reason: String,
    },
    #[error("downloaded archive is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Body of the trigger endpoint. Only `success` is always present.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TriggerResponse {
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "deserialize_file_size")]
    pub file_size: Option<u64>,
}

/// `file_size` arrives as a JSON number or as a numeric string.
fn deserialize_file_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeField {
        Number(u64),
        Text(String),
    }

    match Option::<SizeField>::deserialize(deserializer)? {
        None => Ok(None),
        Some(SizeField::Number(size)) => Ok(Some(size)),
        Some(SizeField::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("`file_size` is not a byte count: {text:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub filename: String,
    pub file_size: u64,
}

impl TriggerResponse {
    pub fn into_backup_info(self) -> Result<BackupInfo, RemoteError> {
        if !self.success {
            return Err(RemoteError::Rejected {
                message: self
                    .message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        let filename = self.filename.ok_or_else(|| RemoteError::Decode {
            stage: RemoteStage::Trigger,
            reason: "missing `filename`".to_string(),
        })?;
        let file_size = self.file_size.ok_or_else(|| RemoteError::Decode {
            stage: RemoteStage::Trigger,
            reason: "missing `file_size`".to_string(),
        })?;
        Ok(BackupInfo {
            filename,
            file_size,
        })
    }
}

/// An open archive body plus the endpoint it came from, for error reports.
pub struct DownloadStream {
    pub url: String,
    pub timeout: Duration,
    pub body: Box<dyn Read>,
}

/// The source site's backup plugin.
pub trait BackupSource {
    fn trigger_backup(&mut self) -> Result<TriggerResponse, RemoteError>;
    fn open_download(&mut self) -> Result<DownloadStream, RemoteError>;
}

pub trait ScriptFetcher {
    fn fetch_script(&mut self, url: &str) -> Result<Vec<u8>, RemoteError>;
}

pub fn request_backup<B: BackupSource>(source: &mut B) -> Result<BackupInfo, RemoteError> {
    source.trigger_backup()?.into_backup_info()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub bytes_written: u64,
    pub sha256: String,
}

/// Streams the archive to `dest` and verifies the on-disk size against
/// `declared_size`. A zero-byte backup produces an empty file without
/// contacting the download endpoint.
pub fn download_archive<B: BackupSource, W: Write>(
    source: &mut B,
    dest: &Path,
    declared_size: u64,
    chunk_size: usize,
    progress: &mut W,
) -> Result<DownloadSummary> {
    let mut file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut hasher = Sha256::new();

    if declared_size == 0 {
        write_progress(progress, 0, 0)?;
        writeln!(progress)?;
    } else {
        let mut stream = source.open_download()?;
        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut received = 0u64;
        loop {
            let read = match stream.body.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(classify_read_error(err, &stream.url, stream.timeout).into());
                }
            };
            file.write_all(&buffer[..read])
                .with_context(|| format!("failed to write {}", dest.display()))?;
            hasher.update(&buffer[..read]);
            received += read as u64;
            write_progress(progress, received, declared_size)?;
        }
        writeln!(progress)?;
    }

    file.sync_all()
        .with_context(|| format!("failed to flush {}", dest.display()))?;
    drop(file);

    let actual = fs::metadata(dest)
        .with_context(|| format!("failed to inspect {}", dest.display()))?
        .len();
    if actual != declared_size {
        return Err(RemoteError::SizeMismatch {
            expected: declared_size,
            actual,
        }
        .into());
    }

    let sha256 = hex_digest(&hasher.finalize());
    debug!(sha256 = %sha256, "archive digest");
    Ok(DownloadSummary {
        bytes_written: actual,
        sha256,
    })
}

/// `\rDownloading: [-----     ] 42%`; a zero total renders as complete.
pub fn render_progress(current: u64, total: u64) -> String {
    let (done, percent) = if total == 0 {
        (PROGRESS_WIDTH, 100)
    } else {
        let ratio = (current.min(total) as f64) / (total as f64);
        (
            (ratio * PROGRESS_WIDTH as f64).floor() as usize,
            (ratio * 100.0).floor() as u64,
        )
    };
    format!(
        "\rDownloading: [{}{}] {percent}%",
        "-".repeat(done),
        " ".repeat(PROGRESS_WIDTH - done)
    )
}

fn write_progress<W: Write>(out: &mut W, current: u64, total: u64) -> Result<()> {
    out.write_all(render_progress(current, total).as_bytes())?;
    out.flush()?;
    Ok(())
}

fn classify_read_error(err: io::Error, url: &str, timeout: Duration) -> RemoteError {
    let timed_out = err.kind() == io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout);
    if timed_out {
        RemoteError::Timeout {
            stage: RemoteStage::Download,
            url: url.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        RemoteError::Transport {
            stage: RemoteStage::Download,
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Blocking HTTP client for the source site's backup endpoints.
pub struct HttpRemote {
    client: Client,
    trigger_url: String,
    download_url: String,
    api_key: String,
    user_agent: String,
    trigger_timeout: Duration,
    download_timeout: Duration,
}

impl HttpRemote {
    pub fn new(settings: &RemoteSettings, source_domain: &str, api_key: &str) -> Result<Self> {
        let base = format!(
            "{}://{}{}",
            settings.scheme, source_domain, settings.api_base_path
        );
        let client = Client::builder()
            .build()
            .context("failed to build remote HTTP client")?;
        Ok(Self {
            client,
            trigger_url: format!("{base}/trigger"),
            download_url: format!("{base}/download"),
            api_key: api_key.to_string(),
            user_agent: settings.user_agent.clone(),
            trigger_timeout: settings.trigger_timeout,
            download_timeout: settings.download_timeout,
        })
    }

    pub fn trigger_url(&self) -> &str {
        &self.trigger_url
    }

    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    fn send(
        &self,
        stage: RemoteStage,
        url: &str,
        timeout: Duration,
        request: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let response = request
            .header("User-Agent", self.user_agent.clone())
            .timeout(timeout)
            .send()
            .map_err(|err| transport_error(stage, url, timeout, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus {
                stage,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl BackupSource for HttpRemote {
    fn trigger_backup(&mut self) -> Result<TriggerResponse, RemoteError> {
        info!("triggering backup at {}", self.trigger_url);
        let request = self
            .client
            .post(&self.trigger_url)
            .header(API_KEY_HEADER, self.api_key.clone());
        let response = self.send(
            RemoteStage::Trigger,
            &self.trigger_url,
            self.trigger_timeout,
            request,
        )?;
        let body = response.text().map_err(|err| {
            transport_error(
                RemoteStage::Trigger,
                &self.trigger_url,
                self.trigger_timeout,
                &err,
            )
        })?;
        serde_json::from_str::<TriggerResponse>(&body).map_err(|err| RemoteError::Decode {
            stage: RemoteStage::Trigger,
            reason: format!("{err} (body starts with {:?})", snippet(&body)),
        })
    }

    fn open_download(&mut self) -> Result<DownloadStream, RemoteError> {
        info!("downloading backup from {}", self.download_url);
        let request = self
            .client
            .get(&self.download_url)
            .header(API_KEY_HEADER, self.api_key.clone());
        let response = self.send(
            RemoteStage::Download,
            &self.download_url,
            self.download_timeout,
            request,
        )?;
        Ok(DownloadStream {
            url: self.download_url.clone(),
            timeout: self.download_timeout,
            body: Box::new(response),
        })
    }
}

impl ScriptFetcher for HttpRemote {
    fn fetch_script(&mut self, url: &str) -> Result<Vec<u8>, RemoteError> {
        info!("fetching permission script from {url}");
        let request = self.client.get(url);
        let response = self.send(RemoteStage::Script, url, self.trigger_timeout, request)?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| transport_error(RemoteStage::Script, url, self.trigger_timeout, &err))
    }
}

fn transport_error(
    stage: RemoteStage,
    url: &str,
    timeout: Duration,
    err: &reqwest::Error,
) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout {
            stage,
            url: url.to_string(),
            seconds: timeout.as_secs(),
        };
    }
    if err.is_decode() {
        return RemoteError::Decode {
            stage,
            reason: err.to_string(),
        };
    }
    RemoteError::Transport {
        stage,
        url: url.to_string(),
        reason: err.to_string(),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}
