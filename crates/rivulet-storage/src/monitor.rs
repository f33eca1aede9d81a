//! Ephemeral Stream Monitor
//!
//! Tracks ephemeral streams that have not been normalized yet and deletes the
//! ones that outlive their TTL.
//!
//! ## Lifecycle
//!
//! 1. [`EphemeralStreamMonitor::start`] spawns one task that loads every
//!    persisted ephemeral stream, then sweeps on a fixed interval.
//! 2. The store reports `on_created` / `on_sealed` after the corresponding
//!    transaction commits.
//! 3. [`EphemeralStreamMonitor::stop`] cancels the task and waits for it.
//!
//! Both the initial load and the sweep loop observe the same cancellation
//! token, so the task has a single exit point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EphemeralMonitorConfig;
use crate::error::{ErrorKind, Result};
use crate::stream_id::StreamId;

/// Storage side of the monitor: listing and deleting ephemeral streams.
#[async_trait]
pub trait EphemeralStreamCleaner: Send + Sync {
    /// Every stream still flagged ephemeral, with its creation time.
    async fn load_ephemeral_streams(&self) -> Result<Vec<(StreamId, DateTime<Utc>)>>;

    /// Delete the stream record and its partitions in one transaction.
    ///
    /// # Errors
    ///
    /// - `NotFound`: already deleted or normalized
    async fn delete_ephemeral_stream(&self, stream_id: &StreamId) -> Result<()>;
}

pub struct EphemeralStreamMonitor {
    streams: DashMap<StreamId, DateTime<Utc>>,
    cleaner: Arc<dyn EphemeralStreamCleaner>,
    config: EphemeralMonitorConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EphemeralStreamMonitor {
    /// Create the monitor and spawn its load-then-sweep task.
    pub fn start(cleaner: Arc<dyn EphemeralStreamCleaner>, config: EphemeralMonitorConfig) -> Arc<Self> {
        let monitor = Arc::new(Self {
            streams: DashMap::new(),
            cleaner,
            config,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        let task = tokio::spawn(monitor.clone().run());
        if let Ok(mut handle) = monitor.handle.try_lock() {
            *handle = Some(task);
        }
        monitor
    }

    async fn run(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            loaded = self.cleaner.load_ephemeral_streams() => match loaded {
                Ok(streams) => {
                    let count = streams.len();
                    for (stream_id, created_at) in streams {
                        // A stream created while loading keeps its newer timestamp.
                        self.streams.entry(stream_id).or_insert(created_at);
                    }
                    info!(count = count, "Loaded ephemeral streams");
                }
                Err(e) => warn!(error = %e, "Failed to load ephemeral streams"),
            },
        }

        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
        debug!("Ephemeral stream monitor stopped");
    }

    pub fn on_created(&self, stream_id: StreamId) {
        self.streams.insert(stream_id, Utc::now());
    }

    pub fn on_sealed(&self, stream_id: &StreamId) {
        self.streams.remove(stream_id);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Delete every tracked stream older than the TTL.
    pub async fn sweep(&self) {
        self.sweep_at(Utc::now()).await;
    }

    /// Sweep as if the current time were `now`. Returns the number of
    /// streams deleted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let expired: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|entry| {
                // Negative ages (clock skew) never expire.
                now.signed_duration_since(*entry.value())
                    .to_std()
                    .map(|age| age >= ttl)
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut deleted = 0;
        for stream_id in expired {
            self.streams.remove(&stream_id);
            match self.cleaner.delete_ephemeral_stream(&stream_id).await {
                Ok(()) => {
                    deleted += 1;
                    info!(stream_id = %stream_id, "Deleted expired ephemeral stream");
                }
                Err(e) if e.is(ErrorKind::NotFound) => {
                    debug!(stream_id = %stream_id, "Expired ephemeral stream already gone");
                }
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Failed to delete expired ephemeral stream");
                }
            }
        }
        deleted
    }

    /// Cancel the background task and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Ephemeral stream monitor task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::stream_id::StreamType;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeCleaner {
        persisted: Vec<(StreamId, DateTime<Utc>)>,
        missing: Vec<StreamId>,
        failing: Vec<StreamId>,
        deleted: StdMutex<Vec<StreamId>>,
    }

    #[async_trait]
    impl EphemeralStreamCleaner for FakeCleaner {
        async fn load_ephemeral_streams(&self) -> Result<Vec<(StreamId, DateTime<Utc>)>> {
            Ok(self.persisted.clone())
        }

        async fn delete_ephemeral_stream(&self, stream_id: &StreamId) -> Result<()> {
            if self.missing.contains(stream_id) {
                return Err(StorageError::not_found("Ephemeral stream not found"));
            }
            if self.failing.contains(stream_id) {
                return Err(StorageError::internal("boom"));
            }
            self.deleted.lock().unwrap().push(*stream_id);
            Ok(())
        }
    }

    fn media(n: u8) -> StreamId {
        StreamId::with_type(StreamType::Media, &[n; 31])
    }

    fn config() -> EphemeralMonitorConfig {
        EphemeralMonitorConfig {
            sweep_interval_ms: 60_000,
            ttl_ms: 600_000,
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired() {
        let cleaner = Arc::new(FakeCleaner::default());
        let monitor = EphemeralStreamMonitor::start(cleaner.clone(), config());

        monitor.on_created(media(1));
        monitor.on_created(media(2));
        monitor.on_sealed(&media(2));
        assert_eq!(monitor.len(), 1);

        assert_eq!(monitor.sweep_at(Utc::now()).await, 0);
        assert!(monitor.contains(&media(1)));

        let later = Utc::now() + chrono::Duration::minutes(11);
        assert_eq!(monitor.sweep_at(later).await, 1);
        assert!(monitor.is_empty());
        assert_eq!(*cleaner.deleted.lock().unwrap(), vec![media(1)]);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_survives_delete_errors() {
        let cleaner = Arc::new(FakeCleaner {
            missing: vec![media(1)],
            failing: vec![media(2)],
            ..Default::default()
        });
        let monitor = EphemeralStreamMonitor::start(cleaner.clone(), config());
        for n in 1..=3 {
            monitor.on_created(media(n));
        }

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(monitor.sweep_at(later).await, 1);
        assert!(monitor.is_empty());
        assert_eq!(*cleaner.deleted.lock().unwrap(), vec![media(3)]);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_persisted_streams_and_sweeps_on_interval() {
        let old = Utc::now() - chrono::Duration::hours(1);
        let cleaner = Arc::new(FakeCleaner {
            persisted: vec![(media(7), old)],
            ..Default::default()
        });
        let monitor = EphemeralStreamMonitor::start(cleaner.clone(), config());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(monitor.contains(&media(7)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!monitor.contains(&media(7)));
        assert_eq!(*cleaner.deleted.lock().unwrap(), vec![media(7)]);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let monitor = EphemeralStreamMonitor::start(Arc::new(FakeCleaner::default()), config());
        monitor.stop().await;
        monitor.stop().await;
    }
}
