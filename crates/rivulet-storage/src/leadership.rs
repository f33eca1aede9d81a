//! Leadership Guard
//!
//! Ensures at most one process writes to a schema at a time.
//!
//! ## Protocol
//!
//! 1. **Acquire** (one transaction): list existing identity records, wait the
//!    startup delay if any exist so a predecessor can exit, delete them all,
//!    insert our own record and `pg_notify` the schema name on the
//!    schema's own channel (see [`leadership_channel`]).
//! 2. **Listen**: a background task waits on the notification channel. A
//!    notification whose payload is our schema means another instance took
//!    over, so the exit signal fires and the task ends.
//! 3. **Verify**: every write transaction checks, before commit, that the
//!    identity table holds exactly one record and that it is ours.
//! 4. **Release**: delete our record (best effort), cancel the listener and
//!    join it.
//!
//! The exit signal is an `mpsc::Sender<StorageError>` owned by the embedding
//! process; it receives at most one `ResourceExhausted` error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool, Row};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, Result, StorageError};
use crate::tx_runner::{AccessMode, RunOpts, TxRunner};

const CHANNEL_SUFFIX: &str = "_leadership";
const MAX_IDENTIFIER_LEN: usize = 63;

/// Notification channel owned by `schema`. Long schema names fall back to a
/// hashed name so the channel stays within Postgres identifier limits.
pub fn leadership_channel(schema: &str) -> String {
    if schema.len() + CHANNEL_SUFFIX.len() <= MAX_IDENTIFIER_LEN {
        format!("{}{}", schema, CHANNEL_SUFFIX)
    } else {
        let digest = Sha256::digest(schema.as_bytes());
        format!("h{}{}", hex::encode(&digest[..16]), CHANNEL_SUFFIX)
    }
}

const LISTENER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delivers a single leadership-lost error to the embedding process.
#[derive(Debug)]
struct ExitSignal {
    tx: mpsc::Sender<StorageError>,
    fired: AtomicBool,
}

impl ExitSignal {
    fn fire(&self, err: StorageError) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.tx.try_send(err) {
            error!(error = %e, "Unable to deliver leadership lost signal");
        }
    }
}

pub struct LeadershipGuard {
    instance_id: String,
    schema: String,
    pool: PgPool,
    signal: Arc<ExitSignal>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LeadershipGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipGuard")
            .field("instance_id", &self.instance_id)
            .field("schema", &self.schema)
            .finish()
    }
}

fn process_info(schema: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("hostname={}, pid={}, schema={}", host, std::process::id(), schema)
}

fn superseded_error(schema: &str, instance_id: &str) -> StorageError {
    StorageError::new(
        ErrorKind::ResourceExhausted,
        "No longer a current instance, shutting down",
    )
    .func("leadership_listener")
    .tag("schema", schema)
    .tag("instance_id", instance_id)
}

impl LeadershipGuard {
    /// Take over the schema and start listening for competing instances.
    ///
    /// `runner` must not have a guard attached.
    pub async fn acquire(
        runner: &TxRunner,
        instance_id: &str,
        startup_delay: Duration,
        exit_tx: mpsc::Sender<StorageError>,
    ) -> Result<Arc<Self>> {
        let schema = runner.schema().to_string();
        let id = instance_id.to_string();
        let info = process_info(&schema);

        {
            let schema = schema.clone();
            runner
                .run(
                    "acquire_leadership",
                    AccessMode::ReadWrite,
                    RunOpts {
                        skip_leadership_check: true,
                        ..Default::default()
                    },
                    vec![("instance_id", id.clone())],
                    move |conn| {
                        Box::pin(replace_identity_tx(
                            conn,
                            id.clone(),
                            info.clone(),
                            schema.clone(),
                            startup_delay,
                        ))
                    },
                )
                .await?;
        }

        // Subscribe only after our own notification has been committed.
        let mut listener = PgListener::connect_with(runner.regular_pool()).await?;
        listener.listen(&leadership_channel(&schema)).await?;

        let signal = Arc::new(ExitSignal {
            tx: exit_tx,
            fired: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(listen_for_new_instances(
            listener,
            schema.clone(),
            instance_id.to_string(),
            signal.clone(),
            cancel.clone(),
        ));

        info!(schema = %schema, instance_id = %instance_id, "Acquired schema leadership");

        Ok(Arc::new(Self {
            instance_id: instance_id.to_string(),
            schema,
            pool: runner.regular_pool().clone(),
            signal,
            cancel,
            listener: Mutex::new(Some(handle)),
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// True once the exit signal has fired.
    pub fn is_lost(&self) -> bool {
        self.signal.fired.load(Ordering::SeqCst)
    }

    /// Pre-commit check: exactly one identity record, and it is ours.
    pub async fn verify(&self, conn: &mut PgConnection) -> Result<()> {
        let rows = sqlx::query("SELECT identity FROM instance_leadership")
            .fetch_all(&mut *conn)
            .await?;

        let ours = rows.len() == 1 && rows[0].get::<String, _>("identity") == self.instance_id;
        if ours {
            return Ok(());
        }

        warn!(
            schema = %self.schema,
            instance_id = %self.instance_id,
            records = rows.len(),
            "Leadership check failed"
        );
        self.signal.fire(
            superseded_error(&self.schema, &self.instance_id).tag("records", rows.len()),
        );
        Err(StorageError::new(
            ErrorKind::ResourceExhausted,
            "No longer a current instance, write rejected",
        )
        .func("verify_leadership")
        .tag("schema", &self.schema)
        .tag("instance_id", &self.instance_id)
        .tag("records", rows.len()))
    }

    /// Remove our identity record. Errors are logged, not returned.
    pub async fn cleanup(&self) {
        let result = sqlx::query("DELETE FROM instance_leadership WHERE identity = $1")
            .bind(&self.instance_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            error!(schema = %self.schema, error = %e, "Error deleting leadership record");
        }
    }

    /// Cancel the listener and wait for it to exit. Safe to call repeatedly.
    pub async fn stop_listener(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Leadership listener task panicked");
            }
        }
    }

    pub async fn release(&self) {
        self.cleanup().await;
        self.stop_listener().await;
        info!(schema = %self.schema, instance_id = %self.instance_id, "Released schema leadership");
    }
}

async fn replace_identity_tx(
    conn: &mut PgConnection,
    instance_id: String,
    info: String,
    schema: String,
    startup_delay: Duration,
) -> Result<()> {
    let rows = sqlx::query("SELECT identity, connected_at, info FROM instance_leadership")
        .fetch_all(&mut *conn)
        .await?;

    for row in &rows {
        let identity: String = row.get("identity");
        let connected_at: DateTime<Utc> = row.get("connected_at");
        let other_info: String = row.get("info");
        info!(
            identity = %identity,
            connected_at = %connected_at,
            info = %other_info,
            "Found existing instance during startup"
        );
    }

    if !rows.is_empty() && !startup_delay.is_zero() {
        info!(
            delay_ms = startup_delay.as_millis() as u64,
            "Delaying startup to let the other instance exit"
        );
        tokio::time::sleep(startup_delay).await;
    }

    sqlx::query("DELETE FROM instance_leadership")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO instance_leadership (identity, connected_at, info) VALUES ($1, $2, $3)",
    )
    .bind(&instance_id)
    .bind(Utc::now())
    .bind(&info)
    .execute(&mut *conn)
    .await?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(leadership_channel(&schema))
        .bind(&schema)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn listen_for_new_instances(
    mut listener: PgListener,
    schema: String,
    instance_id: String,
    signal: Arc<ExitSignal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(schema = %schema, "Leadership listener stopped");
                return;
            }
            received = listener.recv() => match received {
                Ok(notification) => {
                    if notification.payload() != schema {
                        continue;
                    }
                    let err = superseded_error(&schema, &instance_id);
                    warn!(error = %err, "Another instance took over the schema");
                    signal.fire(err);
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "Leadership listener error, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_signal_fires_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let signal = ExitSignal {
            tx,
            fired: AtomicBool::new(false),
        };

        signal.fire(superseded_error("node_a", "id-1"));
        signal.fire(superseded_error("node_a", "id-1"));

        let err = rx.recv().await.unwrap();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(err.tag_value("schema"), Some("node_a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_leadership_channel_is_per_schema() {
        assert_eq!(leadership_channel("node_a"), "node_a_leadership");
        assert_ne!(leadership_channel("node_a"), leadership_channel("node_b"));

        let long_a = format!("{}a", "s".repeat(62));
        let long_b = format!("{}b", "s".repeat(62));
        let channel = leadership_channel(&long_a);
        assert!(channel.len() <= MAX_IDENTIFIER_LEN);
        assert!(channel.ends_with(CHANNEL_SUFFIX));
        assert_ne!(channel, leadership_channel(&long_b));
    }

    #[test]
    fn test_process_info_mentions_schema() {
        let info = process_info("node_b");
        assert!(info.contains("schema=node_b"));
        assert!(info.contains(&format!("pid={}", std::process::id())));
    }
}
