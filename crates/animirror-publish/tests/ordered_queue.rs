use animirror_publish::{MediaStore, PublishError, PublishQueue, TaskState, UploadTask};
use animirror_store::{MediaRow, StoreError};
use animirror_telegram::{ChatClient, ChatRef, SentMessage, TelegramError};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct MockChat {
    counter: AtomicI64,
}

impl MockChat {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl ChatClient for MockChat {
    async fn resolve_chat(&self, _chat_id: &str) -> Result<ChatRef, TelegramError> {
        Ok(ChatRef {
            id: -100,
            title: Some("mirror".to_string()),
        })
    }

    async fn saved_chat(&self) -> Result<ChatRef, TelegramError> {
        Ok(ChatRef {
            id: 777,
            title: None,
        })
    }

    async fn send_video(
        &self,
        chat: &ChatRef,
        _path: &Path,
        _caption: &str,
        _buttons: Option<&Value>,
        _supports_streaming: bool,
    ) -> Result<SentMessage, TelegramError> {
        // Give concurrent per-key workers a chance to interleave.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let message_id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SentMessage {
            message_id,
            chat_id: chat.id,
            file_unique_id: Some(format!("uniq-{}", message_id)),
            file_size: Some(1024),
        })
    }
}

struct HungChat;

#[async_trait]
impl ChatClient for HungChat {
    async fn resolve_chat(&self, _chat_id: &str) -> Result<ChatRef, TelegramError> {
        Ok(ChatRef { id: 1, title: None })
    }

    async fn saved_chat(&self) -> Result<ChatRef, TelegramError> {
        Ok(ChatRef { id: 1, title: None })
    }

    async fn send_video(
        &self,
        _chat: &ChatRef,
        _path: &Path,
        _caption: &str,
        _buttons: Option<&Value>,
        _supports_streaming: bool,
    ) -> Result<SentMessage, TelegramError> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct MockSink {
    rows: Mutex<Vec<MediaRow>>,
}

impl MockSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn recorded(&self) -> Vec<MediaRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaStore for MockSink {
    async fn record_media(&self, media: &MediaRow) -> Result<(), StoreError> {
        self.rows.lock().unwrap().push(media.clone());
        Ok(())
    }
}

fn temp_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("animirror_queue_test_{}", stamp));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn task(dir: &Path, work_id: &str, translation_id: i64, number: i32) -> UploadTask {
    let episode_id = format!("{}:{}:{}", work_id, translation_id, number);
    let file_path = dir.join(format!("{}-{}-{}.mp4", work_id, translation_id, number));
    fs::write(&file_path, b"video bytes").expect("write payload");
    UploadTask {
        episode_id,
        work_id: work_id.to_string(),
        translation_id,
        number,
        file_path,
        caption: format!("{} — серия {}", work_id, number),
        buttons: None,
        quality: Some(720),
        checksum: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
        size_bytes: Some(11),
    }
}

async fn wait_finished(queue: &PublishQueue, episode_ids: &[String]) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut done = true;
            for episode_id in episode_ids {
                match queue.task_state(episode_id).await {
                    Some(TaskState::Completed { .. }) | Some(TaskState::Failed { .. }) => {}
                    _ => done = false,
                }
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("uploads did not finish in time");
}

fn message_ids_for(rows: &[MediaRow], work_id: &str, translation_id: i64) -> Vec<(String, i64)> {
    let prefix = format!("{}:{}:", work_id, translation_id);
    rows.iter()
        .filter(|row| row.episode_id.starts_with(&prefix))
        .map(|row| (row.episode_id.clone(), row.telegram_message_id))
        .collect()
}

fn assert_strictly_increasing(pairs: &[(String, i64)], expected_len: usize) {
    assert_eq!(pairs.len(), expected_len, "rows: {:?}", pairs);
    for window in pairs.windows(2) {
        assert!(
            window[1].1 > window[0].1,
            "message ids not increasing: {:?}",
            pairs
        );
    }
}

#[tokio::test]
async fn single_key_uploads_in_enqueue_order() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(MockChat::new(), sink.clone(), "me".to_string(), 16);

    let mut episode_ids = Vec::new();
    for number in 1..=5 {
        let upload = task(&dir, "A", 1, number);
        episode_ids.push(upload.episode_id.clone());
        queue.enqueue(upload).await.expect("enqueue");
    }
    wait_finished(&queue, &episode_ids).await;

    let rows = sink.recorded();
    // Rows are recorded in completion order, which for one key must match
    // enqueue order with strictly increasing message ids.
    let pairs = message_ids_for(&rows, "A", 1);
    let ordered: Vec<String> = pairs.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ordered, episode_ids);
    assert_strictly_increasing(&pairs, 5);

    for episode_id in &episode_ids {
        assert!(matches!(
            queue.task_state(episode_id).await,
            Some(TaskState::Completed { .. })
        ));
    }
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn interleaved_keys_stay_ordered_within_each_key() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(MockChat::new(), sink.clone(), "me".to_string(), 16);

    let mut episode_ids = Vec::new();
    for number in 1..=5 {
        for (work_id, translation_id) in [("A", 2_i64), ("B", 1_i64)] {
            let upload = task(&dir, work_id, translation_id, number);
            episode_ids.push(upload.episode_id.clone());
            queue.enqueue(upload).await.expect("enqueue");
        }
    }
    wait_finished(&queue, &episode_ids).await;

    let rows = sink.recorded();
    assert_strictly_increasing(&message_ids_for(&rows, "A", 2), 5);
    assert_strictly_increasing(&message_ids_for(&rows, "B", 1), 5);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn temp_files_are_deleted_after_upload() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(MockChat::new(), sink.clone(), "me".to_string(), 4);

    let upload = task(&dir, "A", 1, 1);
    let file_path = upload.file_path.clone();
    let episode_id = upload.episode_id.clone();
    queue.enqueue(upload).await.expect("enqueue");
    wait_finished(&queue, &[episode_id]).await;

    assert!(!file_path.exists(), "temp file should be removed");
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_file_fails_the_task_without_recording_media() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(MockChat::new(), sink.clone(), "me".to_string(), 4);

    let mut upload = task(&dir, "A", 1, 1);
    fs::remove_file(&upload.file_path).expect("remove payload");
    upload.file_path = dir.join("gone.mp4");
    let episode_id = upload.episode_id.clone();
    queue.enqueue(upload).await.expect("enqueue");
    wait_finished(&queue, &[episode_id.clone()]).await;

    assert!(matches!(
        queue.task_state(&episode_id).await,
        Some(TaskState::Failed { .. })
    ));
    assert!(sink.recorded().is_empty());
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn shutdown_rejects_further_enqueues() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(MockChat::new(), sink, "me".to_string(), 4);

    queue.shutdown(Duration::from_millis(100)).await;

    let err = queue.enqueue(task(&dir, "A", 1, 1)).await.unwrap_err();
    assert!(matches!(err, PublishError::QueueClosed));
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn shutdown_deadline_aborts_a_hung_upload() {
    let dir = temp_dir();
    let sink = MockSink::new();
    let queue = PublishQueue::new(Arc::new(HungChat), sink.clone(), "me".to_string(), 4);

    let upload = task(&dir, "A", 1, 1);
    queue.enqueue(upload).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(3), queue.shutdown(Duration::from_millis(200)))
        .await
        .expect("shutdown must respect its deadline");

    assert!(sink.recorded().is_empty());
    let _ = fs::remove_dir_all(&dir);
}
