#![allow(dead_code)]

use async_trait::async_trait;
use linksync::cache::{CacheKey, FetchError, Fetcher};
use linksync::http_fetcher::WriteRequest;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Scripted backend: queued responses are served first, then the fallback.
pub struct MockFetcher {
    reads: AtomicUsize,
    active_reads: AtomicUsize,
    peak_reads: AtomicUsize,
    writes: AtomicUsize,
    read_queue: Mutex<VecDeque<Result<Value, FetchError>>>,
    read_fallback: Mutex<Result<Value, FetchError>>,
    write_queue: Mutex<VecDeque<Result<Option<Value>, FetchError>>>,
    write_fallback: Mutex<Result<Option<Value>, FetchError>>,
    written: Mutex<Vec<WriteRequest>>,
    delay: Duration,
}

impl MockFetcher {
    pub fn returning(value: Value) -> Self {
        Self {
            reads: AtomicUsize::new(0),
            active_reads: AtomicUsize::new(0),
            peak_reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            read_queue: Mutex::new(VecDeque::new()),
            read_fallback: Mutex::new(Ok(value)),
            write_queue: Mutex::new(VecDeque::new()),
            write_fallback: Mutex::new(Ok(None)),
            written: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(error: FetchError) -> Self {
        let mock = Self::returning(Value::Null);
        *mock.read_fallback.lock().unwrap() = Err(error);
        mock
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve `responses` in order before falling back.
    pub fn with_reads(
        self,
        responses: impl IntoIterator<Item = Result<Value, FetchError>>,
    ) -> Self {
        self.read_queue.lock().unwrap().extend(responses);
        self
    }

    pub fn with_write_result(self, result: Result<Option<Value>, FetchError>) -> Self {
        *self.write_fallback.lock().unwrap() = result;
        self
    }

    pub fn with_writes(
        self,
        responses: impl IntoIterator<Item = Result<Option<Value>, FetchError>>,
    ) -> Self {
        self.write_queue.lock().unwrap().extend(responses);
        self
    }

    pub fn set_read_result(&self, result: Result<Value, FetchError>) {
        *self.read_fallback.lock().unwrap() = result;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Most reads that were ever running at the same time.
    pub fn peak_concurrent_reads(&self) -> usize {
        self.peak_reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<WriteRequest> {
        self.written.lock().unwrap().clone()
    }
}

/// Counts a read as running until dropped, even if the read is cancelled.
struct ActiveRead<'a>(&'a AtomicUsize);

impl<'a> ActiveRead<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveRead<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    type Value = Value;
    type Payload = WriteRequest;

    async fn read(&self, _key: &CacheKey) -> Result<Value, FetchError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveRead::enter(&self.active_reads, &self.peak_reads);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.read_queue.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.read_fallback.lock().unwrap().clone())
    }

    async fn write(
        &self,
        _key: &CacheKey,
        payload: WriteRequest,
    ) -> Result<Option<Value>, FetchError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.written.lock().unwrap().push(payload);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.write_queue.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.write_fallback.lock().unwrap().clone())
    }
}

pub fn key(raw: &str) -> CacheKey {
    CacheKey::parse(raw).unwrap()
}

/// Delta prepending `item` to a JSON array (a missing value counts as empty).
pub fn prepend(item: Value) -> impl Fn(Option<&Value>) -> Value + Send + Sync + 'static {
    move |current| {
        let mut items = vec![item.clone()];
        if let Some(Value::Array(existing)) = current {
            items.extend(existing.iter().cloned());
        }
        Value::Array(items)
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future` but give up after a second.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .expect("timed out")
}
