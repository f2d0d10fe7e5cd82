//! Debounced persistence wrapper shared by the four stores: state is loaded
//! lazily (concurrent first readers share the load behind the mutex),
//! mutations mark the file dirty and arm a single delayed flush, and
//! `flush()` forces any pending write out synchronously.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{atomic, StoreError};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

pub struct DebouncedFile<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DebouncedFile<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    path: PathBuf,
    backup: bool,
    debounce: Duration,
    state: Mutex<Option<T>>,
    dirty: AtomicBool,
    flush_armed: AtomicBool,
}

impl<T> DebouncedFile<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    pub fn new(path: PathBuf, backup: bool) -> Self {
        Self::with_debounce(path, backup, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(path: PathBuf, backup: bool, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                backup,
                debounce,
                state: Mutex::new(None),
                dirty: AtomicBool::new(false),
                flush_armed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let mut slot = self.inner.state.lock().await;
        let state =
            slot.get_or_insert_with(|| atomic::load_or_default(&self.inner.path, self.inner.backup));
        f(state)
    }

    pub async fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut slot = self.inner.state.lock().await;
            let state = slot
                .get_or_insert_with(|| atomic::load_or_default(&self.inner.path, self.inner.backup));
            f(state)
        };
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.arm_flush();
        result
    }

    fn arm_flush(&self) {
        if self.inner.flush_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.flush_armed.store(false, Ordering::SeqCst);
            if let Err(err) = flush_now(&inner).await {
                // Leave dirty data in memory; the next mutation re-arms a write.
                inner.dirty.store(true, Ordering::SeqCst);
                warn!(path = %inner.path.display(), error = %err, "debounced store write failed");
            }
        });
    }

    /// Force any pending write to disk. Invoked at daemon shutdown.
    pub async fn flush(&self) -> Result<(), StoreError> {
        flush_now(&self.inner).await
    }
}

async fn flush_now<T>(inner: &Arc<Inner<T>>) -> Result<(), StoreError>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    if !inner.dirty.swap(false, Ordering::SeqCst) {
        return Ok(());
    }
    let payload = {
        let slot = inner.state.lock().await;
        match slot.as_ref() {
            Some(state) => atomic::to_pretty_json(state)?,
            None => return Ok(()),
        }
    };
    atomic::write_atomic(&inner.path, &payload, inner.backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_flush() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("counter.json");
        let file: DebouncedFile<Counter> =
            DebouncedFile::with_debounce(path.clone(), false, Duration::from_millis(20));

        for _ in 0..10 {
            file.mutate(|c| c.value += 1).await;
        }
        assert!(!path.exists(), "write is still pending");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let contents = std::fs::read_to_string(&path).expect("flushed");
        let parsed: Counter = serde_json::from_str(&contents).expect("parse");
        assert_eq!(parsed.value, 10);
    }

    #[tokio::test]
    async fn flush_forces_pending_write() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("counter.json");
        let file: DebouncedFile<Counter> =
            DebouncedFile::with_debounce(path.clone(), false, Duration::from_secs(60));

        file.mutate(|c| c.value = 7).await;
        file.flush().await.expect("flush");
        let parsed: Counter =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed.value, 7);
    }

    #[tokio::test]
    async fn lazy_load_sees_existing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("counter.json");
        std::fs::write(&path, "{\"value\": 41}\n").expect("seed");

        let file: DebouncedFile<Counter> = DebouncedFile::new(path.clone(), false);
        let value = file.read(|c| c.value).await;
        assert_eq!(value, 41);

        file.mutate(|c| c.value += 1).await;
        file.flush().await.expect("flush");
        let parsed: Counter =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed.value, 42);
    }
}
