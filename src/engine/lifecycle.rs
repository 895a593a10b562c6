use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::ledger::check_no_conflict;
use super::policy::{self, RefundTerms};
use super::{now_ms, Engine, EngineError};
use super::{MAX_GUESTS, MAX_STAY_DURATION_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub check_in: Ms,
    pub check_out: Ms,
    pub guests: u32,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    /// The hold (and the pending booking) lapse at this instant unless a
    /// payment confirmation arrives first.
    pub expires_at: Ms,
    pub intent_ref: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModifyRequest {
    pub check_in: Option<Ms>,
    pub check_out: Option<Ms>,
    pub guests: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModifyReceipt {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub span: Span,
    pub guests: u32,
    pub amount_cents: i64,
    pub change_fee_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationReceipt {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub terms: RefundTerms,
    /// False when the booking held no captured payment, the terms earn
    /// nothing back, or the gateway refused after bounded retries (the
    /// owed refund stays recorded on the booking either way).
    pub refund_issued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Requested(i64),
    AlreadyRequested,
    NothingToRefund,
}

fn valid_currency(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

fn validate_stay(check_in: Ms, check_out: Ms, guests: u32, now: Ms) -> Result<Span, EngineError> {
    if check_in >= check_out {
        return Err(EngineError::Validation("check-out must be after check-in"));
    }
    if check_in < MIN_VALID_TIMESTAMP_MS || check_out > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    if check_in < now {
        return Err(EngineError::Validation("check-in must not be in the past"));
    }
    let span = Span::new(check_in, check_out);
    if span.duration_ms() > MAX_STAY_DURATION_MS {
        return Err(EngineError::Validation("stay too long"));
    }
    if guests == 0 || guests > MAX_GUESTS {
        return Err(EngineError::Validation("guest count out of range"));
    }
    Ok(span)
}

impl Engine {
    /// Persist and apply one state transition. The caller holds the booking's
    /// write lock and has verified the transition is permitted.
    pub(super) async fn apply_transition(
        &self,
        booking: &mut Booking,
        to: BookingStatus,
        actor: Actor,
        reason: Option<String>,
        at: Ms,
    ) -> Result<(), EngineError> {
        self.persist(&Event::StatusChanged {
            booking_id: booking.id,
            status: to,
            at,
            actor,
            reason: reason.clone(),
        })
        .await?;
        booking.transition(to, actor, reason, at);
        metrics::counter!(observability::TRANSITIONS_TOTAL, "status" => to.as_str()).increment(1);
        Ok(())
    }

    /// Release any slot (hold or allocation). Idempotent: releasing an
    /// already-released slot is a no-op, not an error.
    pub(super) async fn release_slot(&self, slot_id: Ulid) -> Result<bool, EngineError> {
        let Some(resource_id) = self.ledger.resource_for_slot(slot_id) else {
            return Ok(false);
        };
        let Some(table) = self.ledger.existing_table(resource_id) else {
            return Ok(false);
        };
        let mut guard = table.write().await;
        if guard.get_slot(slot_id).is_none() {
            return Ok(false);
        }
        self.persist_and_apply_slot(
            &mut guard,
            &Event::HoldReleased {
                id: slot_id,
                resource_id,
            },
        )
        .await?;
        Ok(true)
    }

    /// Release a hold only if it has lapsed. Refuses to touch allocations or
    /// still-live holds, so a reaper sweep can never race a confirmation
    /// into dropping a durable claim.
    pub(super) async fn release_lapsed_hold(
        &self,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let Some(resource_id) = self.ledger.resource_for_slot(slot_id) else {
            return Ok(false);
        };
        let Some(table) = self.ledger.existing_table(resource_id) else {
            return Ok(false);
        };
        let mut guard = table.write().await;
        match guard.get_slot(slot_id) {
            Some(slot) if matches!(slot.kind, SlotKind::Hold { .. }) && !slot.is_active(now) => {
                self.persist_and_apply_slot(
                    &mut guard,
                    &Event::HoldReleased {
                        id: slot_id,
                        resource_id,
                    },
                )
                .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Create a booking: validate, claim the range, persist the pending
    /// record, then ask the gateway for a payment intent.
    ///
    /// Denied availability fails fast with nothing persisted. If intent
    /// creation fails after the hold was acquired, the hold is released and
    /// the booking failed before the error returns — no orphaned holds.
    pub async fn create_booking(
        &self,
        req: CreateBookingRequest,
    ) -> Result<BookingReceipt, EngineError> {
        let now = now_ms();
        let span = validate_stay(req.check_in, req.check_out, req.guests, now)?;
        if req.amount_cents <= 0 {
            return Err(EngineError::Validation("amount must be positive"));
        }
        if !valid_currency(&req.currency) {
            return Err(EngineError::Validation("currency must be a 3-letter ISO code"));
        }

        let booking_id = Ulid::new();
        let hold_id = Ulid::new();
        let expires_at = now + self.config.hold_ttl_ms;

        // Check-and-set under the resource write lock: the overlap check and
        // the hold insertion are atomic with respect to concurrent claims.
        let table = self.ledger.table(req.resource_id);
        {
            let mut slots = table.write().await;
            if let Err(e) = check_no_conflict(&slots, &span, now, None) {
                metrics::counter!(observability::HOLDS_DENIED_TOTAL).increment(1);
                return Err(e);
            }

            self.persist(&Event::BookingCreated {
                id: booking_id,
                resource_id: req.resource_id,
                user_id: req.user_id,
                span,
                guests: req.guests,
                amount_cents: req.amount_cents,
                currency: req.currency.clone(),
                created_at: now,
            })
            .await?;
            let mut booking = Booking::new(
                booking_id,
                req.resource_id,
                req.user_id,
                span,
                req.guests,
                req.amount_cents,
                req.currency.clone(),
                now,
            );
            booking.hold_id = Some(hold_id);
            self.bookings
                .insert(booking_id, std::sync::Arc::new(tokio::sync::RwLock::new(booking)));

            self.persist_and_apply_slot(
                &mut slots,
                &Event::HoldPlaced {
                    id: hold_id,
                    resource_id: req.resource_id,
                    booking_id,
                    span,
                    expires_at,
                },
            )
            .await?;
        }
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);

        // Gateway call happens outside the resource lock; contention on the
        // range is bounded by the in-memory check plus one WAL round-trip.
        match self
            .gateway
            .create_intent(req.amount_cents, &req.currency, booking_id)
            .await
        {
            Ok(intent) => {
                self.persist(&Event::IntentAttached {
                    booking_id,
                    intent_ref: intent.intent_ref.clone(),
                })
                .await?;
                if let Some(arc) = self.booking_arc(booking_id) {
                    arc.write().await.intent_ref = Some(intent.intent_ref.clone());
                }
                tracing::info!(
                    "booking {booking_id} pending on resource {} until {expires_at}",
                    req.resource_id
                );
                Ok(BookingReceipt {
                    booking_id,
                    status: BookingStatus::Pending,
                    expires_at,
                    intent_ref: intent.intent_ref,
                    client_secret: intent.client_secret,
                })
            }
            Err(e) => {
                self.release_slot(hold_id).await?;
                let mut b = self.lock_for_transition(booking_id)?;
                b.hold_id = None;
                self.apply_transition(
                    &mut b,
                    BookingStatus::Failed,
                    Actor::System,
                    Some("payment intent creation failed".into()),
                    now_ms(),
                )
                .await?;
                Err(EngineError::Gateway(e.to_string()))
            }
        }
    }

    /// Confirm a pending booking after the gateway reports payment success.
    /// Invoked only by the reconciliation dispatcher, never by clients.
    ///
    /// When the hold lapsed before the payment arrived, the booking is
    /// failed first and `HoldExpired` is returned — a distinct outcome from
    /// generic failure, because the caller must trigger an automatic refund:
    /// the money is real even if the room is gone.
    pub async fn confirm_payment(
        &self,
        booking_id: Ulid,
        intent_ref: &str,
    ) -> Result<(), EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        if b.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                booking_id,
                current: b.status,
            });
        }
        if b.intent_ref.as_deref() != Some(intent_ref) {
            return Err(EngineError::Validation("payment intent does not match booking"));
        }

        let resource_id = b.resource_id;
        let table = self.ledger.table(resource_id);
        let mut slots = table.write().await;

        let live_hold = b
            .hold_id
            .and_then(|hid| slots.get_slot(hid))
            .is_some_and(|slot| slot.is_active(now));

        if live_hold {
            let hold_id = b.hold_id.expect("checked above");
            self.persist_and_apply_slot(
                &mut slots,
                &Event::HoldConverted {
                    id: hold_id,
                    resource_id,
                },
            )
            .await?;
            drop(slots);
            self.apply_transition(&mut b, BookingStatus::Confirmed, Actor::Gateway, None, now)
                .await?;
            tracing::info!("booking {booking_id} confirmed");
            Ok(())
        } else {
            // The hold lapsed before the payment arrived. Drop the stale
            // hold if it is still in the table and fail the booking; the
            // dispatcher refunds the captured payment.
            if let Some(hid) = b.hold_id
                && slots.get_slot(hid).is_some()
            {
                self.persist_and_apply_slot(
                    &mut slots,
                    &Event::HoldReleased {
                        id: hid,
                        resource_id,
                    },
                )
                .await?;
            }
            drop(slots);
            b.hold_id = None;
            self.apply_transition(
                &mut b,
                BookingStatus::Failed,
                Actor::System,
                Some("hold expired before payment confirmation".into()),
                now,
            )
            .await?;
            tracing::warn!("booking {booking_id}: payment arrived after hold expiry");
            Err(EngineError::HoldExpired(booking_id))
        }
    }

    /// Fail a pending booking (payment failed or was cancelled upstream).
    pub async fn fail_booking(
        &self,
        booking_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        if !b.status.allows(BookingStatus::Failed) {
            return Err(EngineError::InvalidTransition {
                booking_id,
                current: b.status,
            });
        }
        if let Some(hid) = b.hold_id {
            self.release_slot(hid).await?;
            b.hold_id = None;
        }
        self.apply_transition(&mut b, BookingStatus::Failed, Actor::Gateway, reason, now)
            .await
    }

    /// Modify a confirmed booking's stay. The replacement range is claimed
    /// before the old allocation is released, so no concurrent booker ever
    /// sees the resource free while the modification is in flight.
    pub async fn modify_booking(
        &self,
        booking_id: Ulid,
        req: ModifyRequest,
    ) -> Result<ModifyReceipt, EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        if !b.status.is_settled() {
            return Err(EngineError::InvalidTransition {
                booking_id,
                current: b.status,
            });
        }

        let policy = self.policies.policy(b.resource_id).unwrap_or_default();
        let terms = policy::evaluate_modification(&b, &policy, now);
        if !terms.allowed {
            return Err(EngineError::PolicyDenied(
                terms.reason.unwrap_or_else(|| "modification window closed".into()),
            ));
        }

        let new_guests = req.guests.unwrap_or(b.guests);
        let new_span = validate_stay(
            req.check_in.unwrap_or(b.span.start),
            req.check_out.unwrap_or(b.span.end),
            new_guests,
            now,
        )?;
        let new_amount = policy::modified_amount(&b, &new_span, new_guests, &policy);

        let resource_id = b.resource_id;
        let table = self.ledger.table(resource_id);
        {
            let mut slots = table.write().await;
            // Acquire-before-release, ignoring the booking's own claim.
            check_no_conflict(&slots, &new_span, now, b.hold_id)?;

            let new_slot = Ulid::new();
            self.persist_and_apply_slot(
                &mut slots,
                &Event::AllocationPlaced {
                    id: new_slot,
                    resource_id,
                    booking_id,
                    span: new_span,
                },
            )
            .await?;
            if let Some(old) = b.hold_id
                && slots.get_slot(old).is_some()
            {
                self.persist_and_apply_slot(
                    &mut slots,
                    &Event::HoldReleased {
                        id: old,
                        resource_id,
                    },
                )
                .await?;
            }
            b.hold_id = Some(new_slot);
        }

        self.persist(&Event::BookingAmended {
            booking_id,
            span: new_span,
            guests: new_guests,
            amount_cents: new_amount,
        })
        .await?;
        b.span = new_span;
        b.guests = new_guests;
        b.amount_cents = new_amount;
        self.apply_transition(&mut b, BookingStatus::Modified, Actor::Guest, None, now)
            .await?;

        Ok(ModifyReceipt {
            booking_id,
            status: b.status,
            span: new_span,
            guests: new_guests,
            amount_cents: new_amount,
            change_fee_cents: terms.change_fee_cents,
        })
    }

    /// Cancel a booking, releasing its claim and issuing at most one refund
    /// per the resource's policy.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        reason: Option<String>,
        actor: Actor,
    ) -> Result<CancellationReceipt, EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        let policy = self.policies.policy(b.resource_id).unwrap_or_default();
        let terms = policy::evaluate_cancellation(&b, &policy, now);

        if !b.status.allows(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                booking_id,
                current: b.status,
            });
        }

        let had_captured_payment = b.status.is_settled();
        if let Some(hid) = b.hold_id {
            self.release_slot(hid).await?;
            b.hold_id = None;
        }
        self.apply_transition(&mut b, BookingStatus::Cancelled, actor, reason, now)
            .await?;

        let mut refund_issued = false;
        if had_captured_payment && terms.refund_cents > 0 && b.refund.is_none() {
            match self.issue_refund(&mut b, terms.refund_cents, now).await {
                Ok(()) => refund_issued = true,
                Err(e) => {
                    tracing::error!("refund for cancelled booking {booking_id} failed: {e}");
                }
            }
        }

        tracing::info!("booking {booking_id} cancelled (refund {} cents)", terms.refund_cents);
        Ok(CancellationReceipt {
            booking_id,
            status: b.status,
            terms,
            refund_issued,
        })
    }

    /// Record the refund as owed, then ask the gateway for it. Recording
    /// first keeps the obligation durable across a gateway outage.
    async fn issue_refund(
        &self,
        booking: &mut Booking,
        amount_cents: i64,
        now: Ms,
    ) -> Result<(), EngineError> {
        let intent_ref = booking
            .intent_ref
            .clone()
            .ok_or(EngineError::Validation("booking has no payment intent"))?;
        self.persist(&Event::RefundRequested {
            booking_id: booking.id,
            amount_cents,
            at: now,
        })
        .await?;
        booking.refund = Some(RefundState {
            amount_cents,
            requested_at: now,
            refund_id: None,
            settled_at: None,
        });
        metrics::counter!(observability::REFUNDS_REQUESTED_TOTAL).increment(1);

        let partial = (amount_cents != booking.amount_cents).then_some(amount_cents);
        self.gateway
            .refund(&intent_ref, partial)
            .await
            .map_err(|e| EngineError::Gateway(e.to_string()))?;
        Ok(())
    }

    /// Idempotently refund the full captured amount. Used by the dispatcher
    /// when a payment succeeded for a booking that can no longer be
    /// confirmed (hold expiry, prior cancellation).
    pub async fn ensure_refund(&self, booking_id: Ulid) -> Result<RefundOutcome, EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        if b.refund.is_some() {
            return Ok(RefundOutcome::AlreadyRequested);
        }
        if b.intent_ref.is_none() {
            return Ok(RefundOutcome::NothingToRefund);
        }
        let amount = b.amount_cents;
        self.issue_refund(&mut b, amount, now).await?;
        Ok(RefundOutcome::Requested(amount))
    }

    /// Record the gateway's refund confirmation.
    pub async fn record_refund(&self, booking_id: Ulid, refund_id: &str) -> Result<(), EngineError> {
        let now = now_ms();
        let mut b = self.lock_for_transition(booking_id)?;
        if b
            .refund
            .as_ref()
            .is_some_and(|r| r.refund_id.as_deref() == Some(refund_id))
        {
            return Ok(());
        }
        self.persist(&Event::RefundSettled {
            booking_id,
            refund_id: refund_id.to_string(),
            at: now,
        })
        .await?;
        let amount_cents = b.amount_cents;
        let state = b.refund.get_or_insert(RefundState {
            amount_cents,
            requested_at: now,
            refund_id: None,
            settled_at: None,
        });
        state.refund_id = Some(refund_id.to_string());
        state.settled_at = Some(now);
        Ok(())
    }

    /// Fail every pending booking whose hold TTL has lapsed. Reaper-driven;
    /// also applied lazily on read so a stale pending booking is never
    /// observable past its TTL.
    pub async fn expire_overdue(&self, now: Ms) -> Vec<Ulid> {
        let mut failed = Vec::new();

        for (slot_id, booking_id, _resource_id) in self.ledger.collect_expired(now) {
            match self.release_lapsed_hold(slot_id, now).await {
                Ok(true) => {
                    metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(1);
                }
                Ok(false) => {} // confirmed or already released in the meantime
                Err(e) => {
                    tracing::warn!("could not release lapsed hold {slot_id}: {e}");
                    continue;
                }
            }
            if self.fail_overdue_pending(booking_id, now).await {
                failed.push(booking_id);
            }
        }

        // Pendings whose hold vanished (e.g. crash between the booking and
        // hold records) still time out on created_at.
        let orphaned: Vec<Ulid> = self
            .bookings
            .iter()
            .filter_map(|entry| {
                entry.value().try_read().ok().and_then(|b| {
                    (b.status == BookingStatus::Pending
                        && b.hold_id.is_none()
                        && b.created_at + self.config.hold_ttl_ms <= now)
                        .then_some(b.id)
                })
            })
            .collect();
        for booking_id in orphaned {
            if self.fail_overdue_pending(booking_id, now).await {
                failed.push(booking_id);
            }
        }

        failed
    }

    pub(super) async fn fail_overdue_pending(&self, booking_id: Ulid, now: Ms) -> bool {
        let Ok(mut b) = self.lock_for_transition(booking_id) else {
            return false; // gone, or a transition is in flight — next sweep
        };
        if b.status != BookingStatus::Pending {
            return false;
        }
        b.hold_id = None;
        self.apply_transition(
            &mut b,
            BookingStatus::Failed,
            Actor::System,
            Some("hold expired without payment confirmation".into()),
            now,
        )
        .await
        .is_ok()
    }

    /// Complete settled bookings whose check-out has passed, releasing their
    /// allocations.
    pub async fn complete_elapsed(&self, now: Ms) -> Vec<Ulid> {
        let elapsed: Vec<Ulid> = self
            .bookings
            .iter()
            .filter_map(|entry| {
                entry.value().try_read().ok().and_then(|b| {
                    (b.status.is_settled() && b.span.end <= now).then_some(b.id)
                })
            })
            .collect();

        let mut completed = Vec::new();
        for booking_id in elapsed {
            let Ok(mut b) = self.lock_for_transition(booking_id) else {
                continue;
            };
            if !b.status.is_settled() || b.span.end > now {
                continue;
            }
            if let Some(hid) = b.hold_id.take()
                && let Err(e) = self.release_slot(hid).await
            {
                tracing::warn!("could not release allocation for completed booking {booking_id}: {e}");
            }
            if self
                .apply_transition(&mut b, BookingStatus::Completed, Actor::System, None, now)
                .await
                .is_ok()
            {
                completed.push(booking_id);
            }
        }
        completed
    }
}
