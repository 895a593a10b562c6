use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedSlotTable = Arc<RwLock<SlotTable>>;

/// The hold table — the single shared mutable resource of the engine.
/// All mutation flows through the lifecycle operations, which serialize on
/// the per-resource write lock; the lock is the check-and-set scope, so two
/// concurrent overlapping claims on one resource cannot both succeed.
pub struct Ledger {
    tables: DashMap<Ulid, SharedSlotTable>,
    /// Reverse lookup: slot id → resource id.
    slot_to_resource: DashMap<Ulid, Ulid>,
}

/// Reject `span` if any active slot in the table overlaps it.
///
/// Lapsed holds are skipped — an expired hold is unusable the instant its
/// TTL passes, regardless of when the reaper gets to it. `exclude` ignores
/// one slot id so a booking's own allocation never conflicts with its
/// replacement range during modification.
pub(super) fn check_no_conflict(
    table: &SlotTable,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for slot in table.overlapping(span) {
        if Some(slot.id) == exclude {
            continue;
        }
        if slot.is_active(now) {
            return Err(EngineError::NotAvailable { conflict: slot.id });
        }
    }
    Ok(())
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            slot_to_resource: DashMap::new(),
        }
    }

    /// Slot table for a resource, created lazily — resources themselves are
    /// owned by the external catalog, the ledger only tracks claims.
    pub(super) fn table(&self, resource_id: Ulid) -> SharedSlotTable {
        self.tables
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(SlotTable::new(resource_id))))
            .value()
            .clone()
    }

    pub(super) fn existing_table(&self, resource_id: Ulid) -> Option<SharedSlotTable> {
        self.tables.get(&resource_id).map(|e| e.value().clone())
    }

    pub(super) fn resource_for_slot(&self, slot_id: Ulid) -> Option<Ulid> {
        self.slot_to_resource.get(&slot_id).map(|e| *e.value())
    }

    /// Apply a slot event to a table the caller has write-locked.
    pub(super) fn apply(&self, table: &mut SlotTable, event: &Event) {
        match event {
            Event::HoldPlaced {
                id,
                resource_id,
                booking_id,
                span,
                expires_at,
            } => {
                table.insert_slot(Slot {
                    id: *id,
                    span: *span,
                    kind: SlotKind::Hold {
                        booking_id: *booking_id,
                        expires_at: *expires_at,
                    },
                });
                self.slot_to_resource.insert(*id, *resource_id);
            }
            Event::AllocationPlaced {
                id,
                resource_id,
                booking_id,
                span,
            } => {
                table.insert_slot(Slot {
                    id: *id,
                    span: *span,
                    kind: SlotKind::Allocation {
                        booking_id: *booking_id,
                    },
                });
                self.slot_to_resource.insert(*id, *resource_id);
            }
            Event::HoldConverted { id, .. } => {
                if let Some(slot) = table.slots.iter_mut().find(|s| s.id == *id)
                    && let SlotKind::Hold { booking_id, .. } = slot.kind
                {
                    slot.kind = SlotKind::Allocation { booking_id };
                }
            }
            Event::HoldReleased { id, .. } => {
                table.remove_slot(*id);
                self.slot_to_resource.remove(id);
            }
            _ => {}
        }
    }

    /// Read-only overlap check against active holds and allocations. Used by
    /// search; not authoritative — authority is the write-locked conflict
    /// check inside the lifecycle operations.
    pub async fn is_available(&self, resource_id: Ulid, span: &Span, now: Ms) -> bool {
        let Some(table) = self.existing_table(resource_id) else {
            return true;
        };
        let guard = table.read().await;
        check_no_conflict(&guard, span, now, None).is_ok()
    }

    /// Every live slot with its resource, for WAL compaction.
    pub(super) fn snapshot_slots(&self) -> Vec<(Ulid, Slot)> {
        let mut out = Vec::new();
        for entry in self.tables.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for slot in &guard.slots {
                    out.push((guard.resource_id, slot.clone()));
                }
            }
        }
        out
    }

    /// Snapshot of lapsed holds for the reaper: (slot, booking, resource).
    pub(super) fn collect_expired(&self, now: Ms) -> Vec<(Ulid, Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.tables.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for slot in &guard.slots {
                    if let SlotKind::Hold {
                        booking_id,
                        expires_at,
                    } = slot.kind
                        && expires_at <= now
                    {
                        expired.push((slot.id, booking_id, guard.resource_id));
                    }
                }
            }
        }
        expired
    }
}
