//! Policy evaluation — pure functions over a booking snapshot, a policy
//! record and an explicit `now`. No clock reads, no I/O: the same inputs
//! always produce the same terms, so every boundary hour is unit-testable.

use serde::Serialize;

use crate::catalog::Policy;
use crate::model::{Booking, Ms, Span, MS_PER_HOUR};

/// Outcome of a cancellation evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefundTerms {
    pub eligible: bool,
    pub refund_cents: i64,
    pub refund_pct: u8,
}

/// Outcome of a modification evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModificationTerms {
    pub allowed: bool,
    pub reason: Option<String>,
    pub change_fee_cents: i64,
}

/// Refund terms for cancelling `booking` at instant `now`.
///
/// Thresholds are inclusive: cancelling exactly `free_window_hours` before
/// check-in still earns the full refund, and exactly `partial_window_hours`
/// still earns the partial percentage.
pub fn evaluate_cancellation(booking: &Booking, policy: &Policy, now: Ms) -> RefundTerms {
    let lead_ms = booking.span.start - now;

    let pct: u8 = if lead_ms >= policy.free_window_hours * MS_PER_HOUR {
        100
    } else if lead_ms >= policy.partial_window_hours * MS_PER_HOUR {
        policy.partial_refund_pct.min(100)
    } else {
        0
    };

    RefundTerms {
        eligible: pct > 0,
        refund_cents: booking.amount_cents * i64::from(pct) / 100,
        refund_pct: pct,
    }
}

/// Whether `booking` may still be modified at instant `now`, and at what fee.
pub fn evaluate_modification(booking: &Booking, policy: &Policy, now: Ms) -> ModificationTerms {
    let lead_ms = booking.span.start - now;

    if lead_ms < policy.modify_until_hours * MS_PER_HOUR {
        return ModificationTerms {
            allowed: false,
            reason: Some(format!(
                "modifications close {} hours before check-in",
                policy.modify_until_hours
            )),
            change_fee_cents: policy.change_fee_cents,
        };
    }

    ModificationTerms {
        allowed: true,
        reason: None,
        change_fee_cents: policy.change_fee_cents,
    }
}

/// New total after changing the stay to `new_span` / `new_guests`.
///
/// The per-night, per-guest rate is derived from the current booking, so the
/// price delta a client is quoted is exactly the amount applied: scaled by
/// the night and guest ratios, plus the change fee.
pub fn modified_amount(booking: &Booking, new_span: &Span, new_guests: u32, policy: &Policy) -> i64 {
    let scaled = booking.amount_cents * new_span.nights() * i64::from(new_guests)
        / (booking.span.nights() * i64::from(booking.guests.max(1)));
    scaled + policy.change_fee_cents
}
