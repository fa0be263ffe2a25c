//! Bounded-attempt redelivery of failed ingestion.
//!
//! Failed events are parked here keyed by `(tenant, protocol id)`. A
//! periodic sweep replays due entries whose session is connected; entries
//! of offline sessions are skipped without spending an attempt. After
//! `max_attempts` failed replays an entry becomes a dead letter: it is
//! logged at error level, written to the audit log, and kept in a bounded
//! in-memory list for operators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ingest::{IngestionPipeline, PendingEvent, ProcessError};
use crate::message::Receipt;
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionStatus};
use crate::store::{AuditEntry, AuditKind};

/// Retry timing and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How often the sweeper runs.
    pub interval: Duration,
    /// Failed replays before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Linear backoff unit: the n-th wait is `n * base_delay`.
    pub base_delay: Duration,
    /// Dead letters kept in memory.
    pub dead_letter_capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(180),
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            dead_letter_capacity: 1000,
        }
    }
}

impl RetryPolicy {
    /// Wait before replay number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// A parked ingestion event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedIngestion {
    /// Session the event arrived on.
    pub session_id: SessionId,
    /// The event snapshot.
    pub event: PendingEvent,
    /// Receipts for the same message that failed while it was parked,
    /// replayed in order after `event`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub receipts: Vec<Receipt>,
    /// Failed replays so far (the original failure is not counted).
    pub attempt_count: u32,
    /// Most recent error.
    pub last_error: String,
    /// When the event first failed.
    pub first_failed_at: DateTime<Utc>,
    /// Earliest time of the next replay.
    pub next_retry_at: DateTime<Utc>,
}

impl FailedIngestion {
    /// Protocol id of the parked event.
    pub fn protocol_message_id(&self) -> &str {
        self.event.protocol_message_id()
    }

    /// Merge a later failure for the same message into this entry.
    ///
    /// A receipt never displaces a parked message; it queues behind it.
    /// A message displaces a parked receipt, which then replays after it.
    fn absorb(&mut self, event: PendingEvent) {
        match event {
            PendingEvent::Receipt(receipt) => self.receipts.push(receipt),
            event => {
                if let PendingEvent::Receipt(earlier) = std::mem::replace(&mut self.event, event) {
                    self.receipts.insert(0, earlier);
                }
            }
        }
    }
}

/// An abandoned entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// The entry as it was when abandoned.
    pub entry: FailedIngestion,
    /// When it was abandoned.
    pub dead_at: DateTime<Utc>,
}

/// What happened to an entry after a failed replay.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Rescheduled.
    Rescheduled {
        /// Failed replays so far.
        attempt_count: u32,
        /// Next replay time.
        next_retry_at: DateTime<Utc>,
    },
    /// Dead-lettered.
    Dead(Box<DeadLetter>),
    /// The entry was no longer queued.
    Missing,
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries replayed.
    pub attempted: u32,
    /// Replays that succeeded.
    pub recovered: u32,
    /// Replays that failed and were rescheduled.
    pub rescheduled: u32,
    /// Entries dead-lettered.
    pub dead: u32,
    /// Due entries skipped because their session was not connected.
    pub skipped: u32,
}

/// Lower bound on the sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

type EntryKey = (String, String);

/// Queue of failed ingestion events.
#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: DashMap<EntryKey, FailedIngestion>,
    dead: Mutex<VecDeque<DeadLetter>>,
    dead_total: AtomicU64,
}

impl RetryQueue {
    /// Create an empty queue.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
            dead: Mutex::new(VecDeque::new()),
            dead_total: AtomicU64::new(0),
        }
    }

    /// The queue's policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Park an event after its first failure.
    ///
    /// An entry already parked under the same key keeps its attempt count;
    /// the new event is merged into it and the error is refreshed.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        event: PendingEvent,
        error: &str,
        now: DateTime<Utc>,
    ) {
        let key = (
            session_id.tenant_id().to_owned(),
            event.protocol_message_id().to_owned(),
        );
        self.entries
            .entry(key)
            .and_modify(|existing| {
                existing.absorb(event.clone());
                existing.last_error = error.to_owned();
            })
            .or_insert_with(|| FailedIngestion {
                session_id: session_id.clone(),
                event: event.clone(),
                receipts: Vec::new(),
                attempt_count: 0,
                last_error: error.to_owned(),
                first_failed_at: now,
                next_retry_at: after(now, self.policy.delay(1)),
            });
    }

    /// Entries whose `next_retry_at` has passed.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<FailedIngestion> {
        self.entries
            .iter()
            .filter(|entry| entry.next_retry_at <= now)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop an entry after a successful replay.
    ///
    /// An entry that absorbed another failure since `entry` was taken stays
    /// queued so the newer event is replayed too.
    pub fn mark_succeeded(&self, entry: &FailedIngestion) -> bool {
        self.entries
            .remove_if(&key_of(entry), |_, current| {
                current.event == entry.event && current.receipts == entry.receipts
            })
            .is_some()
    }

    /// Record a failed replay; reschedules or dead-letters the entry.
    pub fn mark_failed(
        &self,
        entry: &FailedIngestion,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryOutcome {
        let key = key_of(entry);
        {
            // The shard guard must be released before the entry is removed below.
            let Some(mut current) = self.entries.get_mut(&key) else {
                return RetryOutcome::Missing;
            };
            current.attempt_count = current.attempt_count.saturating_add(1);
            current.last_error = error.to_owned();
            if current.attempt_count < self.policy.max_attempts {
                let wait = self.policy.delay(current.attempt_count.saturating_add(1));
                current.next_retry_at = after(now, wait);
                return RetryOutcome::Rescheduled {
                    attempt_count: current.attempt_count,
                    next_retry_at: current.next_retry_at,
                };
            }
        }

        let Some((_, entry)) = self.entries.remove(&key) else {
            return RetryOutcome::Missing;
        };
        let dead = DeadLetter { entry, dead_at: now };
        self.dead_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ring) = self.dead.lock() {
            if self.policy.dead_letter_capacity > 0 {
                while ring.len() >= self.policy.dead_letter_capacity {
                    ring.pop_front();
                }
                ring.push_back(dead.clone());
            }
        }
        RetryOutcome::Dead(Box::new(dead))
    }

    /// Currently parked entries.
    pub fn pending(&self) -> Vec<FailedIngestion> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of parked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent dead letters, newest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead
            .lock()
            .map(|ring| ring.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Total entries dead-lettered since start.
    pub fn dead_letter_count(&self) -> u64 {
        self.dead_total.load(Ordering::Relaxed)
    }
}

/// Replay every due entry whose session is connected.
pub async fn sweep(
    pipeline: &IngestionPipeline,
    registry: &SessionRegistry,
    now: DateTime<Utc>,
) -> SweepReport {
    let queue = pipeline.retry_queue();
    let mut report = SweepReport::default();

    for entry in queue.due(now) {
        let connected = registry
            .get(&entry.session_id)
            .is_some_and(|handle| handle.status() == SessionStatus::Connected);
        if !connected {
            report.skipped = report.skipped.saturating_add(1);
            continue;
        }

        report.attempted = report.attempted.saturating_add(1);
        let error = match replay(pipeline, &entry).await {
            Ok(()) => {
                queue.mark_succeeded(&entry);
                report.recovered = report.recovered.saturating_add(1);
                debug!(
                    session_id = %entry.session_id,
                    protocol_message_id = %entry.protocol_message_id(),
                    "retried ingestion succeeded"
                );
                continue;
            }
            Err(e) => e.to_string(),
        };

        match queue.mark_failed(&entry, &error, now) {
            RetryOutcome::Rescheduled {
                attempt_count,
                next_retry_at,
            } => {
                report.rescheduled = report.rescheduled.saturating_add(1);
                warn!(
                    session_id = %entry.session_id,
                    protocol_message_id = %entry.protocol_message_id(),
                    attempt_count,
                    %next_retry_at,
                    error = %error,
                    "retried ingestion failed"
                );
            }
            RetryOutcome::Dead(dead) => {
                report.dead = report.dead.saturating_add(1);
                record_dead_letter(pipeline, &dead).await;
            }
            RetryOutcome::Missing => {}
        }
    }

    report
}

async fn replay(pipeline: &IngestionPipeline, entry: &FailedIngestion) -> Result<(), ProcessError> {
    pipeline.process(&entry.session_id, &entry.event).await?;
    for receipt in &entry.receipts {
        pipeline
            .process(&entry.session_id, &PendingEvent::Receipt(receipt.clone()))
            .await?;
    }
    Ok(())
}

async fn record_dead_letter(pipeline: &IngestionPipeline, dead: &DeadLetter) {
    let entry = &dead.entry;
    let snapshot = serde_json::to_string(&entry.event).unwrap_or_default();
    error!(
        session_id = %entry.session_id,
        protocol_message_id = %entry.protocol_message_id(),
        attempts = entry.attempt_count,
        error = %entry.last_error,
        event = %snapshot,
        "ingestion abandoned after max retries"
    );

    let audit = AuditEntry {
        kind: AuditKind::DeadLetter,
        tenant_id: entry.session_id.tenant_id().to_owned(),
        session_id: Some(entry.session_id.clone()),
        detail: format!(
            "{} after {} attempts: {}",
            entry.protocol_message_id(),
            entry.attempt_count,
            entry.last_error
        ),
        created_at: dead.dead_at,
    };
    if let Err(e) = pipeline.store().append_audit(&audit).await {
        warn!(error = %e, "failed to audit dead letter");
    }
}

/// Run the retry sweeper until shutdown is signalled.
pub async fn run_retry_sweeper(
    pipeline: std::sync::Arc<IngestionPipeline>,
    registry: std::sync::Arc<SessionRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval_secs = pipeline.retry_queue().policy().interval.as_secs();
    info!(interval_secs, "retry sweeper started");

    let period = pipeline
        .retry_queue()
        .policy()
        .interval
        .max(MIN_SWEEP_INTERVAL);
    let mut interval = tokio::time::interval(period);
    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = sweep(&pipeline, &registry, Utc::now()).await;
                if report != SweepReport::default() {
                    debug!(?report, "retry sweep finished");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("retry sweeper shutting down");
                    break;
                }
            }
        }
    }

    info!("retry sweeper stopped");
}

fn key_of(entry: &FailedIngestion) -> EntryKey {
    (
        entry.session_id.tenant_id().to_owned(),
        entry.protocol_message_id().to_owned(),
    )
}

fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
