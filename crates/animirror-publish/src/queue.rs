use crate::downloader::cleanup_file;
use animirror_store::{MediaRow, StoreError, mark_media};
use animirror_telegram::{ChatClient, ChatRef, TelegramError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub type QueueKey = (String, i64);

#[derive(Debug)]
pub enum PublishError {
    Chat(TelegramError),
    Store(StoreError),
    MissingFile(PathBuf),
    QueueClosed,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Chat(err) => write!(f, "chat error: {}", err),
            PublishError::Store(err) => write!(f, "store error: {}", err),
            PublishError::MissingFile(path) => {
                write!(f, "local file missing: {}", path.display())
            }
            PublishError::QueueClosed => write!(f, "publish queue is shut down"),
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub episode_id: String,
    pub work_id: String,
    pub translation_id: i64,
    pub number: i32,
    pub file_path: PathBuf,
    pub caption: String,
    pub buttons: Option<Value>,
    pub quality: Option<i32>,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
}

impl UploadTask {
    fn key(&self) -> QueueKey {
        (self.work_id.clone(), self.translation_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Uploading,
    Completed { message_id: i64 },
    Failed { error: String },
}

/// Where the queue records a finished publish. `PgPool` is the production
/// implementation; tests substitute an in-memory sink.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn record_media(&self, media: &MediaRow) -> Result<(), StoreError>;
}

#[async_trait]
impl MediaStore for PgPool {
    async fn record_media(&self, media: &MediaRow) -> Result<(), StoreError> {
        let mut tx = self.begin().await.map_err(StoreError::from)?;
        mark_media(&mut tx, media).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}

/// Publishes episodes strictly in enqueue order within one
/// (work, translation) key: each live key owns a bounded FIFO and a single
/// worker task, so chat message ids grow monotonically per key while
/// distinct keys proceed concurrently.
pub struct PublishQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    chat: Arc<dyn ChatClient>,
    store: Arc<dyn MediaStore>,
    target_chat_id: String,
    capacity: usize,
    closing: AtomicBool,
    resolved_chat: OnceCell<ChatRef>,
    senders: Mutex<HashMap<QueueKey, mpsc::Sender<UploadTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    states: Mutex<HashMap<String, TaskState>>,
}

impl PublishQueue {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        store: Arc<dyn MediaStore>,
        target_chat_id: String,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                chat,
                store,
                target_chat_id,
                capacity: capacity.max(1),
                closing: AtomicBool::new(false),
                resolved_chat: OnceCell::new(),
                senders: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Suspends only when the key's FIFO is full.
    pub async fn enqueue(&self, task: UploadTask) -> Result<(), PublishError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(PublishError::QueueClosed);
        }
        self.inner
            .set_state(&task.episode_id, TaskState::Pending)
            .await;
        let sender = self.sender_for(task.key()).await;
        sender
            .send(task)
            .await
            .map_err(|_| PublishError::QueueClosed)
    }

    pub async fn task_state(&self, episode_id: &str) -> Option<TaskState> {
        self.inner.states.lock().await.get(episode_id).cloned()
    }

    /// Drains in-flight uploads within the deadline, then aborts whatever is
    /// left. Queued-but-unstarted tasks are dropped; the next publish poll
    /// re-discovers them because their media row never appeared.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.senders.lock().await.clear();

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        let deadline = Instant::now() + timeout;
        for mut handle in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!("publish queue stopped");
    }

    async fn sender_for(&self, key: QueueKey) -> mpsc::Sender<UploadTask> {
        let mut senders = self.inner.senders.lock().await;
        if let Some(sender) = senders.get(&key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let inner = self.inner.clone();
        let worker_key = key.clone();
        let handle = tokio::spawn(async move {
            worker_loop(inner, worker_key, rx).await;
        });
        self.inner.workers.lock().await.push(handle);
        senders.insert(key, tx.clone());
        tx
    }
}

async fn worker_loop(inner: Arc<QueueInner>, key: QueueKey, mut rx: mpsc::Receiver<UploadTask>) {
    while let Some(task) = rx.recv().await {
        if inner.closing.load(Ordering::SeqCst) {
            // Drain without sending; the episode stays unpublished and will
            // be re-polled after restart.
            cleanup_file(&task.file_path).await;
            continue;
        }
        inner
            .set_state(&task.episode_id, TaskState::Uploading)
            .await;
        info!(
            episode_id = %task.episode_id,
            work_id = %key.0,
            translation_id = key.1,
            number = task.number,
            "uploading episode"
        );
        match inner.process(&task).await {
            Ok(message_id) => {
                inner
                    .set_state(&task.episode_id, TaskState::Completed { message_id })
                    .await;
            }
            Err(err) => {
                error!(episode_id = %task.episode_id, "upload failed: {}", err);
                inner
                    .set_state(
                        &task.episode_id,
                        TaskState::Failed {
                            error: err.to_string(),
                        },
                    )
                    .await;
            }
        }
        // The temp file goes away on success and failure alike.
        cleanup_file(&task.file_path).await;
    }
}

impl QueueInner {
    async fn set_state(&self, episode_id: &str, state: TaskState) {
        self.states
            .lock()
            .await
            .insert(episode_id.to_string(), state);
    }

    async fn target_chat(&self) -> Result<&ChatRef, TelegramError> {
        self.resolved_chat
            .get_or_try_init(|| async {
                match self.chat.resolve_chat(&self.target_chat_id).await {
                    Ok(chat) => Ok(chat),
                    Err(err) => {
                        warn!(
                            chat_id = %self.target_chat_id,
                            "chat resolution failed, falling back to saved messages: {}",
                            err
                        );
                        self.chat.saved_chat().await
                    }
                }
            })
            .await
    }

    async fn process(&self, task: &UploadTask) -> Result<i64, PublishError> {
        let chat = self.target_chat().await.map_err(PublishError::Chat)?;

        if !tokio::fs::try_exists(&task.file_path).await.unwrap_or(false) {
            return Err(PublishError::MissingFile(task.file_path.clone()));
        }

        let message = self
            .chat
            .send_video(chat, &task.file_path, &task.caption, task.buttons.as_ref(), true)
            .await
            .map_err(PublishError::Chat)?;

        let media = MediaRow {
            episode_id: task.episode_id.clone(),
            telegram_chat_id: message.chat_id.to_string(),
            telegram_message_id: message.message_id,
            file_unique_id: message.file_unique_id.clone(),
            quality: task.quality,
            source_url: None,
            checksum: task.checksum.clone(),
            size_bytes: task.size_bytes.or(message.file_size),
        };
        self.store
            .record_media(&media)
            .await
            .map_err(PublishError::Store)?;

        Ok(message.message_id)
    }
}
