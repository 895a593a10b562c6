use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Bad input; the caller should not retry unchanged.
    Validation(&'static str),
    NotFound(Ulid),
    /// Another active hold or allocation overlaps the requested range.
    NotAvailable { conflict: Ulid },
    /// Transition attempted from a state that does not permit it. Carries
    /// the current state so callers can reconcile.
    InvalidTransition {
        booking_id: Ulid,
        current: BookingStatus,
    },
    /// Another transition on the same booking is in flight; rejected, not
    /// queued.
    TransitionInFlight(Ulid),
    /// Payment arrived after the hold lapsed; triggers an automatic refund.
    HoldExpired(Ulid),
    /// Policy window forbids the operation at this time.
    PolicyDenied(String),
    InvalidSignature,
    /// Upstream gateway failure after bounded retries.
    Gateway(String),
    WalError(String),
}

impl EngineError {
    /// Stable error code for the client-facing `{code, message}` shape.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::PolicyDenied(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::NotAvailable { .. } => "NOT_AVAILABLE",
            EngineError::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::TransitionInFlight(_) => "TRANSITION_IN_FLIGHT",
            EngineError::HoldExpired(_) => "HOLD_EXPIRED",
            EngineError::InvalidSignature => "INVALID_SIGNATURE",
            EngineError::Gateway(_) => "GATEWAY_ERROR",
            EngineError::WalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NotAvailable { conflict } => {
                write!(f, "not available: overlaps active claim {conflict}")
            }
            EngineError::InvalidTransition {
                booking_id,
                current,
            } => write!(
                f,
                "invalid transition for booking {booking_id}: currently {current}"
            ),
            EngineError::TransitionInFlight(id) => {
                write!(f, "booking {id} has a transition in flight")
            }
            EngineError::HoldExpired(id) => {
                write!(f, "hold expired for booking {id} before confirmation")
            }
            EngineError::PolicyDenied(reason) => write!(f, "policy denied: {reason}"),
            EngineError::InvalidSignature => write!(f, "webhook signature verification failed"),
            EngineError::Gateway(e) => write!(f, "payment gateway error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
