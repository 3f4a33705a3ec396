//! Configuration service: a single atomic cell holding the current
//! `ConfigSnapshot`, published to bounded subscribers on every update.
//!
//! Generalized from the `other_examples` snapshot-redaction pattern
//! (typed, immutable view structs) and the `arc-swap` lock-free idiom
//! confirmed in-pack (`hlieu5402-collab-spark2026/spark-core/src/arc_swap.rs`).
//! `Current()` never blocks — `ArcSwap::load_full()` is a plain atomic
//! pointer load.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use crate::error::{Error, Result};
use crate::model::{ConfigSnapshot, UpdateKind, UpdateSource};

const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

struct Subscription {
    id: u64,
    sender: mpsc::Sender<Arc<ConfigSnapshot>>,
}

/// Single-writer-many-reader configuration store.
pub struct ConfigService {
    current: ArcSwap<ConfigSnapshot>,
    update_lock: AsyncMutex<()>,
    subscribers: RwLock<Vec<Subscription>>,
    next_sub_id: std::sync::atomic::AtomicU64,
    subscriber_buffer: usize,
}

impl ConfigService {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            update_lock: AsyncMutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    /// Lock-free, never nil (spec §4.1).
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Atomically install `new` as the current snapshot (version
    /// bumped by one relative to the outgoing snapshot), then fan it
    /// out to subscribers. Cannot fail for in-memory reasons (spec
    /// §4.1) — installation itself is infallible.
    pub async fn update(&self, mut new: ConfigSnapshot, kind: UpdateKind, source: UpdateSource) {
        let _guard = self.update_lock.lock().await;

        let prev_version = self.current.load().version;
        new.version = prev_version + 1;
        new.timestamp = chrono::Utc::now();

        let snapshot = Arc::new(new);
        self.current.store(snapshot.clone());

        tracing::info!(
            version = snapshot.version,
            kind = ?kind,
            source = %source,
            "config updated"
        );

        self.fan_out(snapshot).await;
    }

    /// Swap only the `path` field, reusing the single atomic-install
    /// path rather than a bespoke in-place mutation.
    pub async fn update_path(&self, path: String) {
        let mut next = (*self.current()).clone();
        next.path = Some(path);
        self.update(next, UpdateKind::PathChanged, "update_path".to_string()).await;
    }

    /// Reload from the snapshot's configured file path. On failure the
    /// current snapshot is left untouched (spec §4.1).
    pub async fn reload_from_file(&self) -> Result<()> {
        let path = self
            .current()
            .path
            .clone()
            .ok_or_else(|| Error::ConfigRead {
                path: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no path configured"),
            })?;

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::ConfigRead { path: path.clone(), source })?;

        let mut parsed: ConfigSnapshot = toml::from_str(&text)
            .map_err(|source| Error::ConfigParse { path: path.clone(), source })?;
        parsed.path = Some(path);

        self.update(parsed, UpdateKind::FileReload, "reload_from_file".to_string()).await;
        Ok(())
    }

    /// Best-effort atomic write-then-rename (spec §6 persistence
    /// layout).
    pub async fn save_to_file(&self) -> Result<()> {
        let snapshot = self.current();
        let path = snapshot
            .path
            .clone()
            .ok_or_else(|| Error::ConfigWrite {
                path: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no path configured"),
            })?;

        let text = toml::to_string_pretty(&*snapshot)?;

        let path_buf = PathBuf::from(&path);
        let tmp_path = path_buf.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp_path, text)
            .await
            .map_err(|source| Error::ConfigWrite { path: path.clone(), source })?;

        tokio::fs::rename(&tmp_path, &path_buf)
            .await
            .map_err(|source| Error::ConfigWrite { path: path.clone(), source })?;

        Ok(())
    }

    /// Buffered subscription (default buffer >= 10 per spec §4.1). The
    /// subscriber immediately receives the current snapshot (`Init`),
    /// then every subsequent update in monotonic version order — a
    /// full channel may skip versions but never delivers out of order.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<ConfigSnapshot>>) {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = self.next_sub_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let _ = tx.try_send(self.current());
        self.subscribers.write().await.push(Subscription { id, sender: tx });

        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    pub async fn close(&self) {
        self.subscribers.write().await.clear();
    }

    async fn fan_out(&self, snapshot: Arc<ConfigSnapshot>) {
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.sender.try_send(snapshot.clone()) {
                tracing::warn!(subscriber_id = sub.id, "config service: subscriber channel full, dropping update");
            }
        }
    }
}
