use ulid::Ulid;

use crate::model::*;

use super::policy::{self, ModificationTerms, RefundTerms};
use super::{now_ms, Engine, EngineError};

impl Engine {
    /// Refund terms a cancellation would earn right now. Read-only; used to
    /// explain terms even when the transition itself is rejected.
    pub async fn preview_cancellation(&self, booking_id: Ulid) -> Result<RefundTerms, EngineError> {
        let arc = self
            .booking_arc(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let b = arc.read().await;
        let p = self.policies.policy(b.resource_id).unwrap_or_default();
        Ok(policy::evaluate_cancellation(&b, &p, now_ms()))
    }

    /// Whether a modification would be allowed right now, and at what fee.
    pub async fn preview_modification(
        &self,
        booking_id: Ulid,
    ) -> Result<ModificationTerms, EngineError> {
        let arc = self
            .booking_arc(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let b = arc.read().await;
        let p = self.policies.policy(b.resource_id).unwrap_or_default();
        Ok(policy::evaluate_modification(&b, &p, now_ms()))
    }

    /// Booking snapshot by id. Overdue-pending expiry is applied lazily on
    /// read: a pending booking past its hold TTL is failed before being
    /// returned, so a stale `pending` is never observable.
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let now = now_ms();

        let overdue = {
            let arc = self.booking_arc(id).ok_or(EngineError::NotFound(id))?;
            let b = arc.read().await;
            b.status == BookingStatus::Pending && b.created_at + self.config.hold_ttl_ms <= now
        };
        if overdue {
            if let Some(hid) = {
                let arc = self.booking_arc(id).ok_or(EngineError::NotFound(id))?;
                let b = arc.read().await;
                b.hold_id
            } {
                let _ = self.release_lapsed_hold(hid, now).await;
            }
            self.fail_overdue_pending(id, now).await;
        }

        let arc = self.booking_arc(id).ok_or(EngineError::NotFound(id))?;
        let b = arc.read().await;
        Ok(b.clone())
    }

    pub async fn list_bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for entry in self.bookings.iter() {
            let b = entry.value().read().await;
            if b.user_id == user_id {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| b.created_at);
        out
    }

    /// Read-only availability check for a resource and range. Not
    /// authoritative for booking — authority is the hold acquisition.
    pub async fn is_available(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<bool, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("query end must be after start"));
        }
        let span = Span::new(start, end);
        Ok(self.ledger.is_available(resource_id, &span, now_ms()).await)
    }

    pub async fn holds(&self, resource_id: Ulid) -> Vec<HoldInfo> {
        let Some(table) = self.ledger.existing_table(resource_id) else {
            return Vec::new();
        };
        let guard = table.read().await;
        guard
            .slots
            .iter()
            .filter_map(|s| match s.kind {
                SlotKind::Hold {
                    booking_id,
                    expires_at,
                } => Some(HoldInfo {
                    id: s.id,
                    resource_id,
                    booking_id,
                    start: s.span.start,
                    end: s.span.end,
                    expires_at,
                }),
                SlotKind::Allocation { .. } => None,
            })
            .collect()
    }

    pub async fn allocations(&self, resource_id: Ulid) -> Vec<AllocationInfo> {
        let Some(table) = self.ledger.existing_table(resource_id) else {
            return Vec::new();
        };
        let guard = table.read().await;
        guard
            .slots
            .iter()
            .filter_map(|s| match s.kind {
                SlotKind::Allocation { booking_id } => Some(AllocationInfo {
                    id: s.id,
                    resource_id,
                    booking_id,
                    start: s.span.start,
                    end: s.span.end,
                }),
                SlotKind::Hold { .. } => None,
            })
            .collect()
    }
}
