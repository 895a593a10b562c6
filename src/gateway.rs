use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

/// Result of creating a payment intent with the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub intent_ref: String,
    /// Handed to the client to complete payment out-of-band.
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub refund_id: String,
    pub status: String,
}

/// Gateway failures. Only `Transient` is retried; `Rejected` means the
/// processor refused the request and retrying the same call cannot help.
#[derive(Debug, Clone)]
pub enum GatewayError {
    Transient(String),
    Rejected(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transient(msg) => write!(f, "transient gateway failure: {msg}"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// External payment processor boundary. The engine only ever creates intents
/// and requests refunds; everything else arrives through webhooks.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        booking_id: Ulid,
    ) -> Result<PaymentIntent, GatewayError>;

    /// `amount_cents: None` refunds the full captured amount.
    async fn refund(
        &self,
        intent_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<Refund, GatewayError>;
}

/// Bounded-retry wrapper. Transient failures are retried with exponential
/// backoff up to `max_attempts`; the state machine above never retries.
pub struct RetryingGateway<G> {
    inner: G,
    max_attempts: u32,
    base_delay: Duration,
}

impl<G: PaymentGateway> RetryingGateway<G> {
    pub fn new(inner: G, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff before attempt `n + 1` (1-based), doubling each round.
    async fn backoff(&self, op: &'static str, attempt: u32, msg: &str) {
        metrics::counter!(crate::observability::GATEWAY_RETRIES_TOTAL).increment(1);
        let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
        tracing::warn!("gateway {op} attempt {attempt} failed ({msg}), retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for RetryingGateway<G> {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        booking_id: Ulid,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.create_intent(amount_cents, currency, booking_id).await {
                Err(GatewayError::Transient(msg)) if attempt < self.max_attempts => {
                    self.backoff("create_intent", attempt, &msg).await;
                }
                other => return other,
            }
        }
    }

    async fn refund(
        &self,
        intent_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<Refund, GatewayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.refund(intent_ref, amount_cents).await {
                Err(GatewayError::Transient(msg)) if attempt < self.max_attempts => {
                    self.backoff("refund", attempt, &msg).await;
                }
                other => return other,
            }
        }
    }
}

/// In-process gateway for development and tests: deterministic reference
/// sequence, scriptable failures, and a record of issued refunds.
pub struct SandboxGateway {
    seq: AtomicU64,
    fail_next_creates: AtomicU32,
    fail_next_refunds: AtomicU32,
    refunds: Mutex<Vec<(String, Option<i64>)>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            fail_next_creates: AtomicU32::new(0),
            fail_next_refunds: AtomicU32::new(0),
            refunds: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` create_intent calls fail transiently.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_next_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` refund calls fail transiently.
    pub fn fail_next_refunds(&self, n: u32) {
        self.fail_next_refunds.store(n, Ordering::SeqCst);
    }

    /// Refund requests seen so far, in order.
    pub fn issued_refunds(&self) -> Vec<(String, Option<i64>)> {
        self.refunds.lock().expect("refund log poisoned").clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        booking_id: Ulid,
    ) -> Result<PaymentIntent, GatewayError> {
        if Self::take_failure(&self.fail_next_creates) {
            return Err(GatewayError::Transient("sandbox: scripted failure".into()));
        }
        if amount_cents <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".into()));
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let _ = currency;
        Ok(PaymentIntent {
            intent_ref: format!("pi_sandbox_{n:08}"),
            client_secret: format!("pi_sandbox_{n:08}_secret_{booking_id}"),
        })
    }

    async fn refund(
        &self,
        intent_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<Refund, GatewayError> {
        if Self::take_failure(&self.fail_next_refunds) {
            return Err(GatewayError::Transient("sandbox: scripted failure".into()));
        }
        self.refunds
            .lock()
            .expect("refund log poisoned")
            .push((intent_ref.to_string(), amount_cents));
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(Refund {
            refund_id: format!("re_sandbox_{n:08}"),
            status: "pending".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sandbox_issues_sequential_refs() {
        let gw = SandboxGateway::new();
        let a = gw.create_intent(1000, "EUR", Ulid::new()).await.unwrap();
        let b = gw.create_intent(1000, "EUR", Ulid::new()).await.unwrap();
        assert_ne!(a.intent_ref, b.intent_ref);
        assert!(a.intent_ref.starts_with("pi_sandbox_"));
    }

    #[tokio::test]
    async fn sandbox_records_refunds() {
        let gw = SandboxGateway::new();
        gw.refund("pi_sandbox_00000001", None).await.unwrap();
        gw.refund("pi_sandbox_00000001", Some(500)).await.unwrap();
        assert_eq!(
            gw.issued_refunds(),
            vec![
                ("pi_sandbox_00000001".into(), None),
                ("pi_sandbox_00000001".into(), Some(500)),
            ]
        );
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let gw = SandboxGateway::new();
        gw.fail_next_creates(2);
        let retrying = RetryingGateway::new(gw, 3, Duration::from_millis(1));
        let intent = retrying.create_intent(1000, "EUR", Ulid::new()).await;
        assert!(intent.is_ok());
    }

    #[tokio::test]
    async fn retry_gives_up_after_bounded_attempts() {
        let gw = SandboxGateway::new();
        gw.fail_next_creates(5);
        let retrying = RetryingGateway::new(gw, 3, Duration::from_millis(1));
        let result = retrying.create_intent(1000, "EUR", Ulid::new()).await;
        assert!(matches!(result, Err(GatewayError::Transient(_))));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let gw = SandboxGateway::new();
        let retrying = RetryingGateway::new(gw, 3, Duration::from_millis(1));
        let result = retrying.create_intent(0, "EUR", Ulid::new()).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
