mod error;
pub mod ledger;
mod lifecycle;
pub mod policy;
mod queries;
#[cfg(test)]
pub(crate) mod test_support;

pub use error::EngineError;
pub use lifecycle::{
    BookingReceipt, CancellationReceipt, CreateBookingRequest, ModifyReceipt, ModifyRequest,
    RefundOutcome,
};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::catalog::PolicyStore;
use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use ledger::Ledger;

// ── Validation limits ────────────────────────────────────────────

/// 2000-01-01 — anything earlier is a client bug, not a stay.
pub(crate) const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01.
pub(crate) const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Stays longer than a year are rejected.
pub(crate) const MAX_STAY_DURATION_MS: Ms = 366 * MS_PER_DAY;
pub(crate) const MAX_GUESTS: u32 = 16;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hold lifetime; a pending booking not confirmed within this window fails.
    pub hold_ttl_ms: Ms,
    /// Processed webhook event ids are kept at least this long — must exceed
    /// the gateway's maximum redelivery window.
    pub event_retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 15 * MS_PER_MINUTE,
            event_retention_ms: 72 * MS_PER_HOUR,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendCount {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends are batched: the first one blocks,
/// every immediately-available append joins the batch, and the whole batch is
/// made durable with a single fsync before any caller is answered.
async fn wal_writer_task(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred_control = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Control commands see a fully flushed log.
                    deferred_control = Some(other);
                    break;
                }
                Err(_) => break, // channel drained
            }
        }

        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred_control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result: io::Result<()> = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.buffer(event) {
            result = Err(e);
            break;
        }
    }
    // Commit unconditionally: a buffer error must not leave half-written
    // bytes for the next batch, and these callers already get the error.
    let committed = wal.commit();
    if result.is_ok() {
        result = committed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let result = Wal::write_rewrite_file(wal.path(), &events)
                .and_then(|()| wal.swap_rewrite_file());
            let _ = response.send(result);
        }
        WalCommand::AppendCount { response } => {
            let _ = response.send(wal.appends_since_rewrite());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub type SharedBooking = Arc<RwLock<Booking>>;

pub struct Engine {
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) ledger: Ledger,
    /// Idempotency ledger: webhook event id → processed-at.
    pub(super) processed_events: DashMap<String, Ms>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub(super) policies: Arc<dyn PolicyStore>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        gateway: Arc<dyn PaymentGateway>,
        policies: Arc<dyn PolicyStore>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_task(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            ledger: Ledger::new(),
            processed_events: DashMap::new(),
            wal_tx,
            gateway,
            policies,
            config,
        };
        engine.rebuild(events);
        Ok(engine)
    }

    /// Rebuild in-memory state from replayed events. Runs before the engine
    /// is shared, so every lock acquisition is uncontended.
    fn rebuild(&self, events: Vec<Event>) {
        let mut bookings: HashMap<Ulid, Booking> = HashMap::new();

        for event in events {
            match event {
                Event::BookingCreated {
                    id,
                    resource_id,
                    user_id,
                    span,
                    guests,
                    amount_cents,
                    currency,
                    created_at,
                } => {
                    bookings.insert(
                        id,
                        Booking::new(
                            id, resource_id, user_id, span, guests, amount_cents, currency,
                            created_at,
                        ),
                    );
                }
                Event::IntentAttached {
                    booking_id,
                    ref intent_ref,
                } => {
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        b.intent_ref = Some(intent_ref.clone());
                    }
                }
                Event::StatusChanged {
                    booking_id,
                    status,
                    at,
                    actor,
                    ref reason,
                } => {
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        b.transition(status, actor, reason.clone(), at);
                    }
                }
                Event::BookingAmended {
                    booking_id,
                    span,
                    guests,
                    amount_cents,
                } => {
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        b.span = span;
                        b.guests = guests;
                        b.amount_cents = amount_cents;
                    }
                }
                Event::RefundRequested {
                    booking_id,
                    amount_cents,
                    at,
                } => {
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        b.refund = Some(RefundState {
                            amount_cents,
                            requested_at: at,
                            refund_id: None,
                            settled_at: None,
                        });
                    }
                }
                Event::RefundSettled {
                    booking_id,
                    ref refund_id,
                    at,
                } => {
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        let state = b.refund.get_or_insert(RefundState {
                            amount_cents: 0,
                            requested_at: at,
                            refund_id: None,
                            settled_at: None,
                        });
                        state.refund_id = Some(refund_id.clone());
                        state.settled_at = Some(at);
                    }
                }
                Event::PaymentEventRecorded { ref event_id, at } => {
                    self.processed_events.insert(event_id.clone(), at);
                }
                Event::HoldPlaced {
                    id,
                    resource_id,
                    booking_id,
                    ..
                }
                | Event::AllocationPlaced {
                    id,
                    resource_id,
                    booking_id,
                    ..
                } => {
                    let table = self.ledger.table(resource_id);
                    let mut guard = table.try_write().expect("replay: uncontended write");
                    self.ledger.apply(&mut guard, &event);
                    if let Some(b) = bookings.get_mut(&booking_id) {
                        b.hold_id = Some(id);
                    }
                }
                Event::HoldConverted { resource_id, .. } => {
                    if let Some(table) = self.ledger.existing_table(resource_id) {
                        let mut guard = table.try_write().expect("replay: uncontended write");
                        self.ledger.apply(&mut guard, &event);
                    }
                }
                Event::HoldReleased { id, resource_id } => {
                    if let Some(table) = self.ledger.existing_table(resource_id) {
                        let mut guard = table.try_write().expect("replay: uncontended write");
                        let owner = guard.get_slot(id).map(|s| s.booking_id());
                        self.ledger.apply(&mut guard, &event);
                        if let Some(b) = owner.and_then(|bid| bookings.get_mut(&bid))
                            && b.hold_id == Some(id)
                        {
                            b.hold_id = None;
                        }
                    }
                }
            }
        }

        for (id, booking) in bookings {
            self.bookings.insert(id, Arc::new(RwLock::new(booking)));
        }
    }

    /// Write an event to the WAL via the group-commit writer.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
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

    /// Persist a slot event, then apply it to the write-locked table.
    pub(super) async fn persist_and_apply_slot(
        &self,
        table: &mut SlotTable,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.persist(event).await?;
        self.ledger.apply(table, event);
        Ok(())
    }

    pub(super) fn booking_arc(&self, id: Ulid) -> Option<SharedBooking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    /// Acquire a booking's write lock without waiting. Transitions are
    /// strictly sequential per booking: a second attempt while one is in
    /// flight is rejected, not queued.
    pub(super) fn lock_for_transition(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<Booking>, EngineError> {
        let arc = self.booking_arc(id).ok_or(EngineError::NotFound(id))?;
        arc.try_write_owned()
            .map_err(|_| EngineError::TransitionInFlight(id))
    }

    pub fn is_event_processed(&self, event_id: &str) -> bool {
        self.processed_events.contains_key(event_id)
    }

    /// Record a webhook event id as processed. Called only after the
    /// corresponding transition has succeeded.
    pub async fn record_processed_event(&self, event_id: &str, now: Ms) -> Result<(), EngineError> {
        self.persist(&Event::PaymentEventRecorded {
            event_id: event_id.to_string(),
            at: now,
        })
        .await?;
        self.processed_events.insert(event_id.to_string(), now);
        Ok(())
    }

    /// Drop processed-event records older than the retention window. The
    /// next compaction drops them from the WAL too.
    pub fn prune_processed_events(&self, now: Ms) -> usize {
        let cutoff = now - self.config.event_retention_ms;
        let before = self.processed_events.len();
        self.processed_events.retain(|_, at| *at > cutoff);
        before - self.processed_events.len()
    }

    pub async fn wal_append_count(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendCount { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with the minimal event set recreating current state:
    /// every booking with its audit history and refund records, every live
    /// slot, and the retained idempotency records.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.bookings.iter() {
            let b = entry
                .value()
                .try_read()
                .map_err(|_| EngineError::WalError("compact: booking lock contended".into()))?;
            events.push(Event::BookingCreated {
                id: b.id,
                resource_id: b.resource_id,
                user_id: b.user_id,
                span: b.span,
                guests: b.guests,
                amount_cents: b.amount_cents,
                currency: b.currency.clone(),
                created_at: b.created_at,
            });
            if let Some(ref intent_ref) = b.intent_ref {
                events.push(Event::IntentAttached {
                    booking_id: b.id,
                    intent_ref: intent_ref.clone(),
                });
            }
            // The creation event above already carries the current span and
            // amount, so amendments need no replay of their own.
            for entry in b.history.iter().skip(1) {
                events.push(Event::StatusChanged {
                    booking_id: b.id,
                    status: entry.status,
                    at: entry.at,
                    actor: entry.actor,
                    reason: entry.reason.clone(),
                });
            }
            if let Some(ref refund) = b.refund {
                events.push(Event::RefundRequested {
                    booking_id: b.id,
                    amount_cents: refund.amount_cents,
                    at: refund.requested_at,
                });
                if let (Some(refund_id), Some(at)) = (&refund.refund_id, refund.settled_at) {
                    events.push(Event::RefundSettled {
                        booking_id: b.id,
                        refund_id: refund_id.clone(),
                        at,
                    });
                }
            }
        }

        for (resource_id, slot) in self.ledger.snapshot_slots() {
            match slot.kind {
                SlotKind::Hold {
                    booking_id,
                    expires_at,
                } => events.push(Event::HoldPlaced {
                    id: slot.id,
                    resource_id,
                    booking_id,
                    span: slot.span,
                    expires_at,
                }),
                SlotKind::Allocation { booking_id } => events.push(Event::AllocationPlaced {
                    id: slot.id,
                    resource_id,
                    booking_id,
                    span: slot.span,
                }),
            }
        }

        for entry in self.processed_events.iter() {
            events.push(Event::PaymentEventRecorded {
                event_id: entry.key().clone(),
                at: *entry.value(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
