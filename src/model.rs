use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the engine uses this.
pub type Ms = i64;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_HOUR: Ms = 3_600_000;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Half-open stay interval `[check_in, check_out)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Number of nights covered by the stay, at least one.
    pub fn nights(&self) -> i64 {
        (self.duration_ms() / MS_PER_DAY).max(1)
    }
}

/// Booking lifecycle states. `Modified` behaves as `Confirmed` for every
/// subsequent operation; `Cancelled`, `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Modified,
    Cancelled,
    Completed,
    Failed,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Confirmed-equivalent states: the stay is paid and allocated.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Modified)
    }

    /// Forward-only transition table. Everything not listed is rejected.
    pub fn allows(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Confirmed, Modified)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
                | (Modified, Modified)
                | (Modified, Cancelled)
                | (Modified, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Modified => "modified",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who drove a transition, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Guest,
    System,
    Gateway,
}

/// One entry in a booking's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: BookingStatus,
    pub at: Ms,
    pub actor: Actor,
    pub reason: Option<String>,
}

/// Refund bookkeeping. Present once a refund has been requested; guards
/// against issuing the same refund twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundState {
    pub amount_cents: i64,
    pub requested_at: Ms,
    pub refund_id: Option<String>,
    pub settled_at: Option<Ms>,
}

/// A booking record. Mutated only through the lifecycle transitions; never
/// hard-deleted — terminal bookings are kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub guests: u32,
    pub amount_cents: i64,
    pub currency: String,
    pub status: BookingStatus,
    pub intent_ref: Option<String>,
    /// Current hold or allocation in the ledger, if any.
    pub hold_id: Option<Ulid>,
    pub refund: Option<RefundState>,
    pub history: Vec<StatusEntry>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        span: Span,
        guests: u32,
        amount_cents: i64,
        currency: String,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            resource_id,
            user_id,
            span,
            guests,
            amount_cents,
            currency,
            status: BookingStatus::Pending,
            intent_ref: None,
            hold_id: None,
            refund: None,
            history: vec![StatusEntry {
                status: BookingStatus::Pending,
                at: created_at,
                actor: Actor::Guest,
                reason: None,
            }],
            created_at,
            updated_at: created_at,
        }
    }

    /// Apply a transition, appending the audit entry. The caller must have
    /// checked `status.allows(to)` — this keeps the last history entry equal
    /// to the current status unconditionally.
    pub fn transition(&mut self, to: BookingStatus, actor: Actor, reason: Option<String>, at: Ms) {
        self.status = to;
        self.updated_at = at;
        self.history.push(StatusEntry {
            status: to,
            at,
            actor,
            reason,
        });
    }
}

/// What a ledger slot represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// Provisional claim pending payment, unusable after `expires_at`.
    Hold { booking_id: Ulid, expires_at: Ms },
    /// Durable claim of a confirmed booking.
    Allocation { booking_id: Ulid },
}

/// A single hold or allocation on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub span: Span,
    pub kind: SlotKind,
}

impl Slot {
    pub fn booking_id(&self) -> Ulid {
        match self.kind {
            SlotKind::Hold { booking_id, .. } | SlotKind::Allocation { booking_id } => booking_id,
        }
    }

    /// An allocation is always active; a hold only until it expires.
    pub fn is_active(&self, now: Ms) -> bool {
        match self.kind {
            SlotKind::Hold { expires_at, .. } => expires_at > now,
            SlotKind::Allocation { .. } => true,
        }
    }
}

/// Per-resource table of holds and allocations, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct SlotTable {
    pub resource_id: Ulid,
    pub slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            slots: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        if let Some(pos) = self.slots.iter().position(|s| s.id == id) {
            Some(self.slots.remove(pos))
        } else {
            None
        }
    }

    pub fn get_slot(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        span: Span,
        guests: u32,
        amount_cents: i64,
        currency: String,
        created_at: Ms,
    },
    IntentAttached {
        booking_id: Ulid,
        intent_ref: String,
    },
    HoldPlaced {
        id: Ulid,
        resource_id: Ulid,
        booking_id: Ulid,
        span: Span,
        expires_at: Ms,
    },
    /// Hold converted into a durable allocation.
    HoldConverted {
        id: Ulid,
        resource_id: Ulid,
    },
    HoldReleased {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Direct allocation, no hold phase (modification of a paid booking).
    AllocationPlaced {
        id: Ulid,
        resource_id: Ulid,
        booking_id: Ulid,
        span: Span,
    },
    StatusChanged {
        booking_id: Ulid,
        status: BookingStatus,
        at: Ms,
        actor: Actor,
        reason: Option<String>,
    },
    BookingAmended {
        booking_id: Ulid,
        span: Span,
        guests: u32,
        amount_cents: i64,
    },
    RefundRequested {
        booking_id: Ulid,
        amount_cents: i64,
        at: Ms,
    },
    RefundSettled {
        booking_id: Ulid,
        refund_id: String,
        at: Ms,
    },
    /// Webhook event id marked processed (idempotency ledger).
    PaymentEventRecorded {
        event_id: String,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub booking_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub booking_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}
