mod conflict;
mod error;
mod queries;
mod reservations;
mod store;

pub use error::EngineError;
pub use reservations::{HoldRequest, PaymentOutcome, Transition};
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<ProviderCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have first, then handle the command.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// Engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long an unpaid hold keeps its slot.
    pub hold_duration: Duration,
    pub min_duration_minutes: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_duration: Duration::from_secs(5 * 60),
            min_duration_minutes: 15,
        }
    }
}

/// Reservation manager over the time-slot store.
///
/// Every mutation is: lock the provider calendar, check the current state,
/// WAL-append, apply, notify. The calendar lock makes the conflict check and
/// the insert one atomic step.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can fall between the snapshot and the file swap.
    pub(super) compaction_gate: RwLock<()>,
    #[cfg(test)]
    pub(super) fail_appends: std::sync::atomic::AtomicUsize,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(None, event);
        }
        store.rebuild_calendars();
        debug!("replayed {} WAL events from {}", events.len(), wal_path.display());

        Ok(Self {
            store,
            wal_tx,
            notify,
            clock,
            settings,
            compaction_gate: RwLock::new(()),
            #[cfg(test)]
            fail_appends: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .fail_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::WalError("injected failure".into()));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        calendar: Option<&mut ProviderCalendar>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(calendar, event);
        drop(_gate);
        self.publish(event);
        Ok(())
    }

    /// Fan a session transition out to the booking's subscribers.
    /// Creation is not published.
    fn publish(&self, event: &Event) {
        if matches!(event, Event::SessionRequested { .. }) {
            return;
        }
        let Some(session_id) = event.session_id() else {
            return;
        };
        let Some(session) = self.store.session(&session_id) else {
            return;
        };
        let notice = TransitionNotice::for_session(&session, notice_reason(event));
        self.notify.send(session.booking_id, &notice);
    }

    /// Lookup session → provider, acquire the provider calendar write lock,
    /// then read the session as it is under that lock.
    pub(super) async fn lock_session(
        &self,
        session_id: &Ulid,
    ) -> Result<(Session, OwnedRwLockWriteGuard<ProviderCalendar>), EngineError> {
        let provider_id = self
            .store
            .session_provider(session_id)
            .ok_or_else(|| EngineError::session_not_found(*session_id))?;
        let guard = self
            .store
            .calendar_or_create(provider_id)
            .write_owned()
            .await;
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| EngineError::session_not_found(*session_id))?;
        Ok((session, guard))
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn notice_reason(event: &Event) -> Option<String> {
    let reason = match event {
        Event::SessionConfirmed { .. } => "confirmed",
        Event::SessionCancelled { reason, .. } => return Some(reason.clone()),
        Event::SessionCompleted { .. } => "completed",
        Event::SessionNoShow { .. } => "no_show",
        Event::PaymentApplied { .. } => "payment_completed",
        Event::PaymentFailed { .. } => "payment_failed",
        _ => return None,
    };
    Some(reason.to_string())
}
