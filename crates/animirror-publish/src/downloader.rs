use animirror_kodik::{KodikClient, KodikError, choose_external_id};
use data_encoding::HEXLOWER;
use md5::{Digest, Md5};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

const STDERR_CAPTURE_LIMIT: usize = 1000;
const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum DownloadError {
    FfmpegNotFound,
    FfmpegFailed { returncode: i32, stderr: String },
    FfmpegTimeout { seconds: u64 },
    FileNotCreated,
    FileEmpty,
    FileTooSmall { size: u64, min: u64 },
    Catalog(KodikError),
    InvalidInput(String),
}

impl DownloadError {
    /// Transient failures are worth a whole-download retry; the rest are
    /// data problems that will not fix themselves.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DownloadError::FfmpegFailed { .. }
                | DownloadError::FfmpegTimeout { .. }
                | DownloadError::Catalog(_)
        )
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::FfmpegNotFound => write!(f, "ffmpeg not found"),
            DownloadError::FfmpegFailed { returncode, stderr } => {
                write!(f, "ffmpeg failed with code {}: {}", returncode, stderr)
            }
            DownloadError::FfmpegTimeout { seconds } => {
                write!(f, "ffmpeg timed out after {}s", seconds)
            }
            DownloadError::FileNotCreated => write!(f, "ffmpeg completed but file not found"),
            DownloadError::FileEmpty => write!(f, "downloaded file is empty"),
            DownloadError::FileTooSmall { size, min } => {
                write!(f, "downloaded file too small: {} < {} bytes", size, min)
            }
            DownloadError::Catalog(err) => write!(f, "catalog error: {}", err),
            DownloadError::InvalidInput(message) => write!(f, "invalid input: {}", message),
        }
    }
}

impl std::error::Error for DownloadError {}

#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    pub temp_dir: PathBuf,
    pub timeout: Duration,
    pub min_file_size: u64,
    pub ffmpeg_path: PathBuf,
    pub container_ext: String,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/animirror"),
            timeout: Duration::from_secs(600),
            min_file_size: 100 * 1024,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            container_ext: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub external_ids: Value,
    pub translation_id: i64,
    pub episode_num: i32,
    pub quality: u32,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Resolves an episode playlist and stream-copies it into a single-file
/// container via an ffmpeg subprocess. Every failure path removes the
/// partial output.
pub struct Downloader {
    kodik: Arc<KodikClient>,
    options: DownloaderOptions,
}

impl Downloader {
    pub fn new(kodik: Arc<KodikClient>, options: DownloaderOptions) -> Result<Self, DownloadError> {
        std::fs::create_dir_all(&options.temp_dir).map_err(|err| {
            DownloadError::InvalidInput(format!(
                "cannot create temp dir {}: {}",
                options.temp_dir.display(),
                err
            ))
        })?;
        Ok(Self { kodik, options })
    }

    pub fn output_path(&self, request: &DownloadRequest) -> PathBuf {
        let source_id = choose_external_id(&request.external_ids)
            .map(|(value, _)| value)
            .unwrap_or_else(|| "unknown".to_string());
        self.options.temp_dir.join(format!(
            "{}-{}-{}.{}",
            source_id, request.translation_id, request.episode_num, self.options.container_ext
        ))
    }

    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadResult, DownloadError> {
        if choose_external_id(&request.external_ids).is_none() {
            return Err(DownloadError::InvalidInput(
                "no external id (shikimori/kinopoisk/imdb)".to_string(),
            ));
        }
        if request.translation_id < 0 || request.episode_num < 1 {
            return Err(DownloadError::InvalidInput(
                "translation id and episode number must be positive".to_string(),
            ));
        }

        let playlist = self
            .kodik
            .get_episode_playlist(
                &request.external_ids,
                request.translation_id,
                request.episode_num,
                request.quality,
            )
            .await
            .map_err(|err| match err {
                KodikError::NotFound(_) => {
                    DownloadError::InvalidInput("no usable external id upstream".to_string())
                }
                KodikError::InvalidInput(message) => DownloadError::InvalidInput(message),
                other => DownloadError::Catalog(other),
            })?;

        let out_path = self.output_path(request);
        info!(
            translation_id = request.translation_id,
            episode = request.episode_num,
            output = %out_path.display(),
            "ffmpeg download start"
        );

        self.run_muxer(&playlist, &out_path).await?;
        self.validate_and_hash(out_path).await
    }

    async fn run_muxer(&self, playlist: &str, out_path: &Path) -> Result<(), DownloadError> {
        let mut command = Command::new(&self.options.ffmpeg_path);
        command
            .arg("-i")
            .arg(playlist)
            .args(["-c", "copy", "-bsf:a", "aac_adtstoasc", "-movflags", "+faststart", "-y"])
            .arg(out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DownloadError::FfmpegNotFound
            } else {
                DownloadError::FfmpegFailed {
                    returncode: -1,
                    stderr: err.to_string(),
                }
            }
        })?;

        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        match tokio::time::timeout(self.options.timeout, child.wait()).await {
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                cleanup_file(out_path).await;
                Err(DownloadError::FfmpegTimeout {
                    seconds: self.options.timeout.as_secs(),
                })
            }
            Ok(Err(err)) => {
                stderr_task.abort();
                cleanup_file(out_path).await;
                Err(DownloadError::FfmpegFailed {
                    returncode: -1,
                    stderr: err.to_string(),
                })
            }
            Ok(Ok(status)) => {
                let stderr_buf = stderr_task.await.unwrap_or_default();
                if !status.success() {
                    cleanup_file(out_path).await;
                    return Err(DownloadError::FfmpegFailed {
                        returncode: status.code().unwrap_or(-1),
                        stderr: truncate_stderr(&stderr_buf),
                    });
                }
                Ok(())
            }
        }
    }

    async fn validate_and_hash(&self, out_path: PathBuf) -> Result<DownloadResult, DownloadError> {
        let metadata = match tokio::fs::metadata(&out_path).await {
            Ok(metadata) => metadata,
            Err(_) => return Err(DownloadError::FileNotCreated),
        };
        let size_bytes = metadata.len();
        if size_bytes == 0 {
            cleanup_file(&out_path).await;
            return Err(DownloadError::FileEmpty);
        }
        if size_bytes < self.options.min_file_size {
            cleanup_file(&out_path).await;
            return Err(DownloadError::FileTooSmall {
                size: size_bytes,
                min: self.options.min_file_size,
            });
        }

        // The chunked read is CPU-bound on large files; hash off the
        // async runtime.
        let hash_path = out_path.clone();
        let checksum = tokio::task::spawn_blocking(move || md5_file(&hash_path))
            .await
            .map_err(|_| DownloadError::FileNotCreated)?;
        let checksum = match checksum {
            Ok(checksum) => checksum,
            Err(_) => {
                cleanup_file(&out_path).await;
                return Err(DownloadError::FileNotCreated);
            }
        };

        Ok(DownloadResult {
            path: out_path,
            size_bytes,
            checksum,
        })
    }
}

fn md5_file(path: &Path) -> Result<String, std::io::Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(HEXLOWER.encode(&hasher.finalize()))
}

fn truncate_stderr(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut text = text.trim().to_string();
    if text.len() > STDERR_CAPTURE_LIMIT {
        let mut cut = STDERR_CAPTURE_LIMIT;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

pub async fn cleanup_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "cannot remove temp file: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_retry_policy() {
        assert!(DownloadError::FfmpegTimeout { seconds: 5 }.is_transient());
        assert!(
            DownloadError::FfmpegFailed {
                returncode: 1,
                stderr: String::new()
            }
            .is_transient()
        );
        assert!(
            DownloadError::Catalog(KodikError::Network("reset".to_string())).is_transient()
        );
        assert!(!DownloadError::FileEmpty.is_transient());
        assert!(!DownloadError::FfmpegNotFound.is_transient());
        assert!(!DownloadError::InvalidInput("x".to_string()).is_transient());
    }

    #[test]
    fn stderr_is_capped_at_capture_limit() {
        let long = vec![b'x'; 4000];
        assert_eq!(truncate_stderr(&long).len(), STDERR_CAPTURE_LIMIT);
        assert_eq!(truncate_stderr(b"short"), "short");
    }

    #[test]
    fn md5_matches_one_shot_digest() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "animirror-md5-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::write(&path, b"hello animirror").unwrap();

        let streamed = md5_file(&path).unwrap();
        let expected = HEXLOWER.encode(&Md5::digest(b"hello animirror"));
        assert_eq!(streamed, expected);

        let _ = std::fs::remove_file(&path);
    }
}
