//! Transaction Runner
//!
//! Every store operation is one database transaction executed through
//! [`TxRunner::run`]:
//!
//! ```text
//! attempt ──ok──────────────────────────────▶ pass
//!    │
//!    └─err──▶ classify ──retryable──▶ backoff ──▶ attempt
//!                  ├────expected─────▶ pass (logged at debug)
//!                  └────terminal─────▶ fail (logged at warn)
//! ```
//!
//! ## Isolation
//!
//! The configured isolation level and the access mode are set with
//! `SET TRANSACTION` as the first statement of each attempt.
//!
//! ## Retries
//!
//! Serialization failures (`40001`) and deadlocks (`40P01`) are retried until
//! they succeed or the operation's timeout fires. The first retry is immediate,
//! the second waits 50ms and every following wait grows by 1.5x.
//!
//! ## Detached Writes
//!
//! Read-write transactions run on a spawned task, so a caller that drops the
//! future (client disconnect) cannot abort a commit halfway. Only the explicit
//! `RunOpts::timeout` bounds them.
//!
//! ## Leadership
//!
//! When a [`LeadershipGuard`] is attached, every read-write transaction verifies
//! that this instance still owns the schema right before committing.
//!
//! ## Telemetry
//!
//! - `dbtx_status{name,status}` counts pass/fail/retry per operation name
//! - `dbtx_duration_seconds{name}` observes total duration including retries
//! - optional ring buffer of recent start/retry/error/done events

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rivulet_observability::metrics::{
    DBTX_DURATION, DBTX_STATUS, STATUS_FAIL, STATUS_PASS, STATUS_RETRY,
};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};

use crate::config::IsolationLevel;
use crate::error::{ErrorKind, Result, StorageError};
use crate::leadership::LeadershipGuard;

const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Caller-supplied context attached to terminal errors and debug events.
pub type Tags = Vec<(&'static str, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    fn as_sql(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "READ ONLY",
            AccessMode::ReadWrite => "READ WRITE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Use the streaming pool reserved for large range scans.
    pub streaming: bool,
    /// Treat `NotFound` as an expected outcome: logged at debug, counted as pass.
    pub expect_not_found: bool,
    /// Bound on the whole operation, retries included.
    pub timeout: Option<Duration>,
    /// Skip the pre-commit leadership check (leadership bookkeeping itself).
    pub skip_leadership_check: bool,
}

impl RunOpts {
    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Default::default()
        }
    }

    pub fn expect_not_found() -> Self {
        Self {
            expect_not_found: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How the runner reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Retry,
    Expected,
    Terminal,
}

pub fn classify(err: &StorageError, expect_not_found: bool) -> Outcome {
    if err.is_retryable() {
        Outcome::Retry
    } else if expect_not_found && err.is(ErrorKind::NotFound) {
        Outcome::Expected
    } else {
        Outcome::Terminal
    }
}

/// Retry delays: `0, base, base*1.5, base*1.5^2, ...`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    next: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            next: None,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        match self.next {
            None => {
                self.next = Some(self.base);
                Duration::ZERO
            }
            Some(delay) => {
                self.next = Some(delay * 3 / 2);
                delay
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Split the connection budget: one connection is kept for the notification
/// listener, at least one goes to the streaming pool.
pub fn split_connections(max_connections: u32, streaming_ratio: f64) -> (u32, u32) {
    let available = max_connections.saturating_sub(1).max(2);
    let streaming = ((available as f64 * streaming_ratio).floor() as u32)
        .max(1)
        .min(available - 1);
    (available - streaming, streaming)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxEventKind {
    Start,
    Retry,
    Error,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxEvent {
    pub at: DateTime<Utc>,
    pub name: &'static str,
    pub kind: TxEventKind,
    pub tags: Tags,
    pub error: Option<String>,
}

#[derive(Debug)]
struct DebugRing {
    capacity: usize,
    events: Mutex<VecDeque<TxEvent>>,
}

impl DebugRing {
    fn push(&self, event: TxEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn snapshot(&self) -> Vec<TxEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().cloned().collect()
    }
}

#[derive(Clone)]
pub struct TxRunner {
    regular: PgPool,
    streaming: PgPool,
    schema: Arc<str>,
    isolation: IsolationLevel,
    ring: Option<Arc<DebugRing>>,
    guard: Option<Arc<LeadershipGuard>>,
}

impl TxRunner {
    pub fn new(
        regular: PgPool,
        streaming: PgPool,
        schema: &str,
        isolation: IsolationLevel,
        debug_buffer_size: usize,
    ) -> Self {
        let ring = (debug_buffer_size > 0).then(|| {
            Arc::new(DebugRing {
                capacity: debug_buffer_size,
                events: Mutex::new(VecDeque::with_capacity(debug_buffer_size)),
            })
        });
        Self {
            regular,
            streaming,
            schema: Arc::from(schema),
            isolation,
            ring,
            guard: None,
        }
    }

    /// A runner that checks `guard` before committing every write.
    pub fn with_guard(&self, guard: Arc<LeadershipGuard>) -> Self {
        let mut runner = self.clone();
        runner.guard = Some(guard);
        runner
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn regular_pool(&self) -> &PgPool {
        &self.regular
    }

    pub fn streaming_pool(&self) -> &PgPool {
        &self.streaming
    }

    /// Recent transaction events, oldest first. Empty when the buffer is disabled.
    pub fn recent_transactions(&self) -> Vec<TxEvent> {
        self.ring.as_ref().map(|r| r.snapshot()).unwrap_or_default()
    }

    pub async fn run<T, F>(
        &self,
        name: &'static str,
        mode: AccessMode,
        opts: RunOpts,
        tags: Tags,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync + 'static,
    {
        match mode {
            AccessMode::ReadOnly => self.run_bounded(name, mode, opts, tags, work).await,
            AccessMode::ReadWrite => {
                let runner = self.clone();
                let handle = tokio::spawn(async move {
                    runner.run_bounded(name, mode, opts, tags, work).await
                });
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        DBTX_STATUS.with_label_values(&[name, STATUS_FAIL]).inc();
                        Err(StorageError::internal(format!("transaction task failed: {}", e))
                            .func(name)
                            .tag("schema", &self.schema))
                    }
                }
            }
        }
    }

    async fn run_bounded<T, F>(
        &self,
        name: &'static str,
        mode: AccessMode,
        opts: RunOpts,
        tags: Tags,
        work: F,
    ) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        match opts.timeout {
            None => self.run_loop(name, mode, &opts, &tags, &work).await,
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_loop(name, mode, &opts, &tags, &work))
                    .await
                {
                    Ok(result) => result,
                    Err(elapsed) => {
                        DBTX_STATUS.with_label_values(&[name, STATUS_FAIL]).inc();
                        let err = self.decorate(StorageError::from(elapsed), name, &tags);
                        warn!(name = name, schema = %self.schema, error = %err, "Transaction timed out");
                        self.record(name, TxEventKind::Error, &tags, Some(&err));
                        Err(err)
                    }
                }
            }
        }
    }

    async fn run_loop<T, F>(
        &self,
        name: &'static str,
        mode: AccessMode,
        opts: &RunOpts,
        tags: &Tags,
        work: &F,
    ) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let started = Instant::now();
        let mut backoff = Backoff::new(BACKOFF_BASE);
        self.record(name, TxEventKind::Start, tags, None);

        loop {
            let err = match self.attempt(mode, opts, work).await {
                Ok(value) => {
                    DBTX_STATUS.with_label_values(&[name, STATUS_PASS]).inc();
                    DBTX_DURATION
                        .with_label_values(&[name])
                        .observe(started.elapsed().as_secs_f64());
                    self.record(name, TxEventKind::Done, tags, None);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match classify(&err, opts.expect_not_found) {
                Outcome::Retry => {
                    DBTX_STATUS.with_label_values(&[name, STATUS_RETRY]).inc();
                    self.record(name, TxEventKind::Retry, tags, Some(&err));
                    let delay = backoff.next_delay();
                    warn!(
                        name = name,
                        schema = %self.schema,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying transaction"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Outcome::Expected => {
                    DBTX_STATUS.with_label_values(&[name, STATUS_PASS]).inc();
                    DBTX_DURATION
                        .with_label_values(&[name])
                        .observe(started.elapsed().as_secs_f64());
                    let err = self.decorate(err, name, tags);
                    debug!(name = name, schema = %self.schema, error = %err, "Transaction found nothing");
                    self.record(name, TxEventKind::Done, tags, Some(&err));
                    return Err(err);
                }
                Outcome::Terminal => {
                    DBTX_STATUS.with_label_values(&[name, STATUS_FAIL]).inc();
                    DBTX_DURATION
                        .with_label_values(&[name])
                        .observe(started.elapsed().as_secs_f64());
                    let err = self.decorate(err, name, tags);
                    warn!(name = name, schema = %self.schema, error = %err, "Transaction failed");
                    self.record(name, TxEventKind::Error, tags, Some(&err));
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<T, F>(&self, mode: AccessMode, opts: &RunOpts, work: &F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let pool = if opts.streaming {
            &self.streaming
        } else {
            &self.regular
        };

        // Dropping `tx` on any early return rolls it back.
        let mut tx = pool.begin().await?;
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            mode.as_sql()
        ))
        .execute(&mut *tx)
        .await?;

        let value = work(&mut *tx).await?;

        if mode == AccessMode::ReadWrite && !opts.skip_leadership_check {
            if let Some(guard) = &self.guard {
                guard.verify(&mut *tx).await?;
            }
        }

        tx.commit().await?;
        Ok(value)
    }

    fn decorate(&self, err: StorageError, name: &'static str, tags: &Tags) -> StorageError {
        err.func(name)
            .tag("schema", &self.schema)
            .tags(tags.iter().map(|(k, v)| (*k, v.as_str())))
    }

    fn record(
        &self,
        name: &'static str,
        kind: TxEventKind,
        tags: &Tags,
        err: Option<&StorageError>,
    ) {
        if let Some(ring) = &self.ring {
            ring.push(TxEvent {
                at: Utc::now(),
                name,
                kind,
                tags: tags.clone(),
                error: err.map(|e| e.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut b = Backoff::new(Duration::from_millis(50));
        assert_eq!(b.next_delay(), Duration::ZERO);
        assert_eq!(b.next_delay(), Duration::from_millis(50));
        assert_eq!(b.next_delay(), Duration::from_millis(75));
        assert_eq!(b.next_delay(), Duration::from_micros(112_500));
        assert_eq!(b.attempts(), 4);
    }

    #[test]
    fn test_classify() {
        let not_found = StorageError::not_found("no row");
        assert_eq!(classify(&not_found, false), Outcome::Terminal);
        assert_eq!(classify(&not_found, true), Outcome::Expected);

        let internal = StorageError::internal("broken");
        assert_eq!(classify(&internal, true), Outcome::Terminal);
    }

    #[test]
    fn test_split_connections() {
        assert_eq!(split_connections(50, 0.1), (45, 4));
        assert_eq!(split_connections(50, 0.0), (48, 1));
        assert_eq!(split_connections(11, 0.3), (7, 3));
        assert_eq!(split_connections(3, 0.3), (1, 1));
        assert_eq!(split_connections(1, 0.3), (1, 1));
    }

    #[test]
    fn test_debug_ring_keeps_latest() {
        let ring = DebugRing {
            capacity: 2,
            events: Mutex::new(VecDeque::new()),
        };
        for kind in [TxEventKind::Start, TxEventKind::Retry, TxEventKind::Done] {
            ring.push(TxEvent {
                at: Utc::now(),
                name: "op",
                kind,
                tags: vec![("stream_id", "abc".to_string())],
                error: None,
            });
        }
        let kinds: Vec<_> = ring.snapshot().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TxEventKind::Retry, TxEventKind::Done]);
    }

    #[test]
    fn test_run_opts_builders() {
        let opts = RunOpts::streaming().with_timeout(Duration::from_secs(5));
        assert!(opts.streaming);
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert!(RunOpts::expect_not_found().expect_not_found);
    }
}
