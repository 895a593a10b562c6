use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::BookingStatus;
use crate::observability;

type HmacSha256 = Hmac<Sha256>;

/// How a webhook delivery was handled. Any of these is an HTTP 200 — the
/// gateway must not redeliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Processed,
    /// Event id already in the processed ledger; no side effects re-applied.
    Duplicate,
    /// Logged and acknowledged without side effects (unknown type, unknown
    /// booking) — redelivery cannot make these processable.
    Ignored,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Processed => "processed",
            Ack::Duplicate => "duplicate",
            Ack::Ignored => "ignored",
        }
    }
}

// Stripe-shaped event envelope: {id, type, data: {object: {...}}}.
#[derive(Debug, Deserialize)]
struct GatewayEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    id: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    booking_id: Option<Ulid>,
}

/// Compute the hex HMAC-SHA256 signature the gateway attaches to a payload.
/// Exposed for tests and local tooling.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Maps asynchronous payment events onto booking transitions with
/// at-most-once side effects per gateway event id.
pub struct Dispatcher {
    engine: Arc<Engine>,
    secret: String,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, secret: String) -> Self {
        Self { engine, secret }
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<(), EngineError> {
        let Some(claimed) = decode_hex(signature.trim()) else {
            return Err(EngineError::InvalidSignature);
        };
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(payload);
        // verify_slice is constant-time.
        mac.verify_slice(&claimed)
            .map_err(|_| EngineError::InvalidSignature)
    }

    /// Handle one delivery. `Ok` means acknowledge (HTTP 200); `Err` means
    /// reject, and for transient errors the gateway's retry will reattempt —
    /// the event is only recorded as processed after its transition succeeds.
    pub async fn handle_event(&self, payload: &[u8], signature: &str) -> Result<Ack, EngineError> {
        if let Err(e) = self.verify_signature(payload, signature) {
            metrics::counter!(observability::WEBHOOK_EVENTS_TOTAL, "outcome" => "invalid_signature")
                .increment(1);
            tracing::warn!("webhook rejected: bad signature");
            return Err(e);
        }

        let event: GatewayEvent = serde_json::from_slice(payload)
            .map_err(|_| EngineError::Validation("malformed webhook payload"))?;

        if self.engine.is_event_processed(&event.id) {
            metrics::counter!(observability::WEBHOOK_EVENTS_TOTAL, "outcome" => "duplicate")
                .increment(1);
            tracing::debug!("webhook {}: duplicate delivery", event.id);
            return Ok(Ack::Duplicate);
        }

        let outcome = match event.kind.as_str() {
            "payment_intent.succeeded" => self.on_payment_succeeded(&event).await,
            "payment_intent.payment_failed" | "payment_intent.canceled" => {
                self.on_payment_failed(&event).await
            }
            "refund.created" => self.on_refund_created(&event).await,
            other => {
                // Not an event this engine acts on; acknowledging avoids
                // endless gateway retries.
                tracing::info!("webhook {}: ignoring event type {other}", event.id);
                Ok(Ack::Ignored)
            }
        };

        match &outcome {
            Ok(ack) => {
                metrics::counter!(observability::WEBHOOK_EVENTS_TOTAL, "outcome" => ack.as_str())
                    .increment(1);
            }
            Err(_) => {
                metrics::counter!(observability::WEBHOOK_EVENTS_TOTAL, "outcome" => "rejected")
                    .increment(1);
            }
        }
        outcome
    }

    async fn on_payment_succeeded(&self, event: &GatewayEvent) -> Result<Ack, EngineError> {
        let Some(booking_id) = event.data.object.metadata.booking_id else {
            tracing::warn!("webhook {}: succeeded event without booking id", event.id);
            return Ok(Ack::Ignored);
        };

        match self
            .engine
            .confirm_payment(booking_id, &event.data.object.id)
            .await
        {
            Ok(()) => self.record(&event.id).await,
            Err(EngineError::HoldExpired(_)) => {
                // The payment is captured but the room is gone: refund it.
                self.engine.ensure_refund(booking_id).await?;
                self.record(&event.id).await
            }
            Err(EngineError::InvalidTransition { current, .. }) => {
                match current {
                    // Already applied — e.g. a redelivery after the transition
                    // succeeded but recording the event id failed.
                    BookingStatus::Confirmed | BookingStatus::Modified | BookingStatus::Completed => {
                        self.record(&event.id).await
                    }
                    // The booking died before the payment landed; the capture
                    // still has to go back.
                    BookingStatus::Failed | BookingStatus::Cancelled => {
                        self.engine.ensure_refund(booking_id).await?;
                        self.record(&event.id).await
                    }
                    BookingStatus::Pending => unreachable!("pending never rejects confirmation"),
                }
            }
            Err(EngineError::NotFound(_)) => {
                tracing::warn!("webhook {}: unknown booking {booking_id}", event.id);
                Ok(Ack::Ignored)
            }
            Err(EngineError::Validation(msg)) => {
                tracing::warn!("webhook {}: {msg}", event.id);
                self.record(&event.id).await
            }
            // TransitionInFlight, WAL and gateway failures are transient:
            // leave the event unprocessed so redelivery retries it.
            Err(e) => Err(e),
        }
    }

    async fn on_payment_failed(&self, event: &GatewayEvent) -> Result<Ack, EngineError> {
        let Some(booking_id) = event.data.object.metadata.booking_id else {
            tracing::warn!("webhook {}: failure event without booking id", event.id);
            return Ok(Ack::Ignored);
        };
        let reason = event
            .data
            .object
            .status
            .clone()
            .unwrap_or_else(|| "payment failed".into());

        match self.engine.fail_booking(booking_id, Some(reason)).await {
            Ok(()) => self.record(&event.id).await,
            Err(EngineError::InvalidTransition { current, .. }) => {
                tracing::info!(
                    "webhook {}: failure event for booking {booking_id} already {current}",
                    event.id
                );
                self.record(&event.id).await
            }
            Err(EngineError::NotFound(_)) => {
                tracing::warn!("webhook {}: unknown booking {booking_id}", event.id);
                Ok(Ack::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_refund_created(&self, event: &GatewayEvent) -> Result<Ack, EngineError> {
        let Some(booking_id) = event.data.object.metadata.booking_id else {
            tracing::warn!("webhook {}: refund event without booking id", event.id);
            return Ok(Ack::Ignored);
        };

        match self
            .engine
            .record_refund(booking_id, &event.data.object.id)
            .await
        {
            Ok(()) => self.record(&event.id).await,
            Err(EngineError::NotFound(_)) => {
                tracing::warn!("webhook {}: unknown booking {booking_id}", event.id);
                Ok(Ack::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, event_id: &str) -> Result<Ack, EngineError> {
        self.engine
            .record_processed_event(event_id, crate::engine::now_ms())
            .await?;
        Ok(Ack::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_verifiable() {
        let payload = br#"{"id":"evt_1"}"#;
        let sig = sign(payload, "secret");
        assert_eq!(sig, sign(payload, "secret"));
        assert_ne!(sig, sign(payload, "other-secret"));
        assert_ne!(sig, sign(br#"{"id":"evt_2"}"#, "secret"));
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
    }

    #[test]
    fn envelope_parses_stripe_shape() {
        let payload = br#"{
            "id": "evt_42",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_1",
                "metadata": {"booking_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV"},
                "amount": 20000,
                "status": "succeeded"
            }}
        }"#;
        let event: GatewayEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(event.id, "evt_42");
        assert_eq!(event.kind, "payment_intent.succeeded");
        assert!(event.data.object.metadata.booking_id.is_some());
    }

    #[test]
    fn envelope_tolerates_missing_metadata() {
        let payload = br#"{"id":"evt_1","type":"ping","data":{"object":{"id":"obj_1"}}}"#;
        let event: GatewayEvent = serde_json::from_slice(payload).unwrap();
        assert!(event.data.object.metadata.booking_id.is_none());
    }

    // ── Dispatcher flows against a real engine ───────────────

    use crate::engine::test_support;
    use crate::engine::{CreateBookingRequest, EngineConfig};
    use crate::model::{Actor, BookingStatus, MS_PER_DAY};

    const SECRET: &str = "whsec_test";

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    fn request(resource_id: Ulid) -> CreateBookingRequest {
        let now = now_ms();
        CreateBookingRequest {
            resource_id,
            user_id: Ulid::new(),
            check_in: now + 30 * MS_PER_DAY,
            check_out: now + 32 * MS_PER_DAY,
            guests: 2,
            amount_cents: 20_000,
            currency: "EUR".into(),
        }
    }

    fn payload(event_id: &str, kind: &str, object_id: &str, booking_id: Ulid) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": event_id,
            "type": kind,
            "data": {"object": {
                "id": object_id,
                "metadata": {"booking_id": booking_id},
                "amount": 20_000,
                "status": "requires_action"
            }}
        }))
        .unwrap()
    }

    async fn dispatcher(name: &str, config: EngineConfig) -> (Dispatcher, Arc<Engine>, Arc<crate::gateway::SandboxGateway>) {
        let (engine, gateway, _) = test_support::engine_with(name, config).await;
        let engine = Arc::new(engine);
        (
            Dispatcher::new(engine.clone(), SECRET.into()),
            engine,
            gateway,
        )
    }

    #[tokio::test]
    async fn succeeded_event_confirms_exactly_once() {
        let (dispatcher, engine, _) = dispatcher("wh_confirm", EngineConfig::default()).await;
        let receipt = engine.create_booking(request(Ulid::new())).await.unwrap();

        let body = payload(
            "evt_1",
            "payment_intent.succeeded",
            &receipt.intent_ref,
            receipt.booking_id,
        );
        let sig = sign(&body, SECRET);

        assert_eq!(
            dispatcher.handle_event(&body, &sig).await.unwrap(),
            Ack::Processed
        );
        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        // One confirmed transition in the audit trail.
        assert_eq!(
            booking
                .history
                .iter()
                .filter(|e| e.status == BookingStatus::Confirmed)
                .count(),
            1
        );

        // Redelivery of the same event id is acknowledged without effects.
        assert_eq!(
            dispatcher.handle_event(&body, &sig).await.unwrap(),
            Ack::Duplicate
        );
        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.history.len(), 2);
    }

    #[tokio::test]
    async fn bad_signature_rejected_without_processing() {
        let (dispatcher, engine, _) = dispatcher("wh_bad_sig", EngineConfig::default()).await;
        let receipt = engine.create_booking(request(Ulid::new())).await.unwrap();

        let body = payload(
            "evt_1",
            "payment_intent.succeeded",
            &receipt.intent_ref,
            receipt.booking_id,
        );
        let result = dispatcher
            .handle_event(&body, &sign(&body, "wrong-secret"))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidSignature)));

        let result = dispatcher.handle_event(&body, "not-even-hex!").await;
        assert!(matches!(result, Err(EngineError::InvalidSignature)));

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(!engine.is_event_processed("evt_1"));
    }

    #[tokio::test]
    async fn malformed_payload_rejected() {
        let (dispatcher, _, _) = dispatcher("wh_malformed", EngineConfig::default()).await;
        let body = b"{\"id\": \"evt_1\"".to_vec();
        let result = dispatcher.handle_event(&body, &sign(&body, SECRET)).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn late_success_refunds_instead_of_confirming() {
        let (dispatcher, engine, gateway) = dispatcher(
            "wh_late",
            EngineConfig {
                hold_ttl_ms: 0,
                ..EngineConfig::default()
            },
        )
        .await;
        let receipt = engine.create_booking(request(Ulid::new())).await.unwrap();

        let body = payload(
            "evt_late",
            "payment_intent.succeeded",
            &receipt.intent_ref,
            receipt.booking_id,
        );
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Processed);

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Failed);
        assert_eq!(gateway.issued_refunds().len(), 1);

        // Redelivery does not refund twice.
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Duplicate);
        assert_eq!(gateway.issued_refunds().len(), 1);
    }

    #[tokio::test]
    async fn success_for_cancelled_booking_refunds() {
        let (dispatcher, engine, gateway) = dispatcher("wh_cancelled", EngineConfig::default()).await;
        let receipt = engine.create_booking(request(Ulid::new())).await.unwrap();
        engine
            .cancel_booking(receipt.booking_id, None, Actor::Guest)
            .await
            .unwrap();

        // The client paid anyway; the capture goes back.
        let body = payload(
            "evt_after_cancel",
            "payment_intent.succeeded",
            &receipt.intent_ref,
            receipt.booking_id,
        );
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Processed);
        assert_eq!(gateway.issued_refunds().len(), 1);

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_event_fails_pending_booking() {
        let (dispatcher, engine, _) = dispatcher("wh_failed", EngineConfig::default()).await;
        let rid = Ulid::new();
        let receipt = engine.create_booking(request(rid)).await.unwrap();

        let body = payload(
            "evt_fail",
            "payment_intent.payment_failed",
            &receipt.intent_ref,
            receipt.booking_id,
        );
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Processed);

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Failed);
        assert!(engine.holds(rid).await.is_empty());
    }

    #[tokio::test]
    async fn refund_created_settles_refund_record() {
        let (dispatcher, engine, _) = dispatcher("wh_refund", EngineConfig::default()).await;
        let receipt = engine.create_booking(request(Ulid::new())).await.unwrap();
        engine
            .confirm_payment(receipt.booking_id, &receipt.intent_ref)
            .await
            .unwrap();
        engine
            .cancel_booking(receipt.booking_id, None, Actor::Guest)
            .await
            .unwrap();

        let body = payload(
            "evt_refund",
            "refund.created",
            "re_123",
            receipt.booking_id,
        );
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Processed);

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        let refund = booking.refund.unwrap();
        assert_eq!(refund.refund_id.as_deref(), Some("re_123"));
        assert!(refund.settled_at.is_some());
    }

    #[tokio::test]
    async fn unknown_event_types_and_bookings_are_acked() {
        let (dispatcher, _, _) = dispatcher("wh_unknown", EngineConfig::default()).await;

        let body = payload("evt_x", "charge.updated", "ch_1", Ulid::new());
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Ignored);

        // Known type, unknown booking: acknowledged, not retried forever.
        let body = payload("evt_y", "payment_intent.succeeded", "pi_1", Ulid::new());
        let sig = sign(&body, SECRET);
        assert_eq!(dispatcher.handle_event(&body, &sig).await.unwrap(), Ack::Ignored);
    }
}
