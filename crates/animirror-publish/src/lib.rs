mod downloader;
mod queue;
mod worker;

pub use downloader::{
    DownloadError, DownloadRequest, DownloadResult, Downloader, DownloaderOptions, cleanup_file,
};
pub use queue::{MediaStore, PublishError, PublishQueue, QueueKey, TaskState, UploadTask};
pub use worker::{PublishWorker, PublishWorkerOptions, WorkerStats, caption_for};
