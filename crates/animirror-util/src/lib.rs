use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};

pub fn chunked<T, I>(items: I, size: usize) -> Vec<Vec<T>>
where
    I: IntoIterator<Item = T>,
{
    let size = size.max(1);
    let mut out: Vec<Vec<T>> = Vec::new();
    let mut batch: Vec<T> = Vec::with_capacity(size);
    for item in items {
        batch.push(item);
        if batch.len() >= size {
            out.push(std::mem::replace(&mut batch, Vec::with_capacity(size)));
        }
    }
    if !batch.is_empty() {
        out.push(batch);
    }
    out
}

/// Runs one worker future per batch with at most `concurrency` in flight.
/// Results come back in batch order.
pub async fn run_limited<T, R, F, Fut>(batches: Vec<Vec<T>>, concurrency: usize, worker: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = batches.len();
    if total == 0 {
        return Vec::new();
    }

    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let worker = Arc::new(worker);
    let mut set = JoinSet::new();
    for (index, batch) in batches.into_iter().enumerate() {
        let limit = limit.clone();
        let worker = worker.clone();
        set.spawn(async move {
            let _permit = limit.acquire_owned().await.ok();
            (index, worker(batch).await)
        });
    }

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        if let Ok((index, result)) = joined {
            slots[index] = Some(result);
        }
    }
    slots.into_iter().flatten().collect()
}

/// Collects channel items into batches, flushing on a size threshold or when
/// the flush interval elapses since the first buffered item.
pub struct Batcher<T> {
    rx: mpsc::Receiver<T>,
    capacity: usize,
    flush_every: Duration,
}

impl<T> Batcher<T> {
    pub fn channel(
        capacity: usize,
        flush_every: Duration,
        buffer: usize,
    ) -> (mpsc::Sender<T>, Batcher<T>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Batcher {
                rx,
                capacity: capacity.max(1),
                flush_every,
            },
        )
    }

    /// Returns `None` once all senders are gone and the buffer is drained.
    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        let mut batch: Vec<T> = Vec::with_capacity(self.capacity);
        let deadline = sleep(self.flush_every);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => {
                        if batch.is_empty() {
                            deadline.as_mut().reset(Instant::now() + self.flush_every);
                        }
                        batch.push(item);
                        if batch.len() >= self.capacity {
                            return Some(batch);
                        }
                    }
                    None => {
                        return if batch.is_empty() { None } else { Some(batch) };
                    }
                },
                _ = &mut deadline, if !batch.is_empty() => return Some(batch),
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn triggered(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // All handles dropped: treat as a stop request.
    }

    /// Sleeps for `duration`, waking early on shutdown. Returns `true` when
    /// shutdown fired.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let wake_at = Instant::now() + duration;
        tokio::select! {
            () = self.triggered() => true,
            () = sleep_until(wake_at) => self.is_triggered(),
        }
    }
}
