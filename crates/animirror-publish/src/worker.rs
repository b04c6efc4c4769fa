use crate::downloader::{DownloadError, DownloadRequest, DownloadResult, Downloader, cleanup_file};
use crate::queue::{PublishQueue, UploadTask};
use animirror_kodik::choose_external_id;
use animirror_store::{PendingEpisode, episodes_without_media};
use animirror_util::Shutdown;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub downloaded: u64,
    pub enqueued: u64,
    pub failed: u64,
    pub skipped_no_external_ids: u64,
}

#[derive(Debug, Clone)]
pub struct PublishWorkerOptions {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub quality: u32,
    pub max_file_size_mb: u64,
}

impl Default for PublishWorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_retries: 3,
            retry_base: Duration::from_secs(2),
            quality: 720,
            max_file_size_mb: 2000,
        }
    }
}

/// Polls for episodes without a published copy, downloads each and hands it
/// to the ordered queue. A failed episode simply stays unpublished and is
/// picked up again on a later poll.
pub struct PublishWorker {
    db: PgPool,
    downloader: Downloader,
    queue: Arc<PublishQueue>,
    options: PublishWorkerOptions,
    shutdown: Shutdown,
    stats: Mutex<WorkerStats>,
}

impl PublishWorker {
    pub fn new(
        db: PgPool,
        downloader: Downloader,
        queue: Arc<PublishQueue>,
        options: PublishWorkerOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            db,
            downloader,
            queue,
            options,
            shutdown,
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub async fn start(&self) {
        info!(
            poll_interval_secs = self.options.poll_interval.as_secs(),
            batch_size = self.options.batch_size,
            "publish worker started"
        );
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.is_triggered() {
                break;
            }
            if let Err(err) = self.tick().await {
                error!("publish tick failed: {}", err);
            }
            if shutdown.sleep(self.options.poll_interval).await {
                break;
            }
        }
        let stats = self.stats.lock().await;
        info!(
            polls = stats.polls,
            downloaded = stats.downloaded,
            enqueued = stats.enqueued,
            failed = stats.failed,
            "publish worker stopped"
        );
    }

    pub async fn tick(&self) -> Result<(), animirror_store::StoreError> {
        let episodes = episodes_without_media(&self.db, self.options.batch_size).await?;
        for episode in episodes {
            if self.shutdown.is_triggered() {
                break;
            }
            self.handle_episode(episode).await;
        }
        self.stats.lock().await.polls += 1;
        Ok(())
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    async fn handle_episode(&self, episode: PendingEpisode) {
        if choose_external_id(&episode.external_ids).is_none() {
            warn!(episode_id = %episode.id, "episode work has no external ids");
            let mut stats = self.stats.lock().await;
            stats.skipped_no_external_ids += 1;
            stats.failed += 1;
            return;
        }

        let request = DownloadRequest {
            external_ids: episode.external_ids.clone(),
            translation_id: episode.translation_id,
            episode_num: episode.number,
            quality: self.options.quality,
        };
        let result = match self.download_with_retries(&request, &episode.id).await {
            Ok(result) => result,
            Err(err) => {
                error!(episode_id = %episode.id, "download failed: {}", err);
                self.stats.lock().await.failed += 1;
                return;
            }
        };
        self.stats.lock().await.downloaded += 1;

        let max_bytes = self.options.max_file_size_mb.saturating_mul(1024 * 1024);
        if max_bytes > 0 && result.size_bytes > max_bytes {
            warn!(
                episode_id = %episode.id,
                size_bytes = result.size_bytes,
                "artifact exceeds the upload size cap"
            );
            cleanup_file(&result.path).await;
            self.stats.lock().await.failed += 1;
            return;
        }

        // Untitled works fall back to the catalog id, as the caption must
        // still identify the series.
        let display_title = episode.work_title.as_deref().unwrap_or(&episode.work_id);
        let task = UploadTask {
            episode_id: episode.id.clone(),
            work_id: episode.work_id.clone(),
            translation_id: episode.translation_id,
            number: episode.number,
            caption: caption_for(display_title, episode.number),
            buttons: None,
            quality: Some(self.options.quality as i32),
            checksum: Some(result.checksum.clone()),
            size_bytes: Some(result.size_bytes as i64),
            file_path: result.path.clone(),
        };
        match self.queue.enqueue(task).await {
            Ok(()) => {
                self.stats.lock().await.enqueued += 1;
            }
            Err(err) => {
                error!(episode_id = %episode.id, "enqueue failed: {}", err);
                cleanup_file(&result.path).await;
                self.stats.lock().await.failed += 1;
            }
        }
    }

    async fn download_with_retries(
        &self,
        request: &DownloadRequest,
        episode_id: &str,
    ) -> Result<DownloadResult, DownloadError> {
        let mut attempt: u32 = 1;
        loop {
            match self.downloader.download(request).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.options.max_retries => {
                    let delay =
                        self.options.retry_base * 2u32.saturating_pow(attempt.saturating_sub(1));
                    warn!(
                        episode_id = %episode_id,
                        attempt,
                        "transient download failure, retrying in {:?}: {}",
                        delay,
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn caption_for(work_title: &str, number: i32) -> String {
    format!("{} — серия {}", work_title, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_uses_title_and_episode_number() {
        assert_eq!(caption_for("Тайтл", 3), "Тайтл — серия 3");
    }
}
