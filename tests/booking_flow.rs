use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use ulid::Ulid;

use caravel::catalog::{MemoryPolicyStore, Policy};
use caravel::engine::{Engine, EngineConfig};
use caravel::gateway::SandboxGateway;
use caravel::http::{self, AppState, SIGNATURE_HEADER};
use caravel::model::MS_PER_HOUR;
use caravel::webhook::{sign, Dispatcher};

const SECRET: &str = "whsec_integration";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<SandboxGateway>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("caravel_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let gateway = Arc::new(SandboxGateway::new());
    let policies = Arc::new(MemoryPolicyStore::new(Policy::default()));
    let engine = Arc::new(
        Engine::new(
            dir.join("caravel.wal"),
            gateway.clone(),
            policies,
            EngineConfig::default(),
        )
        .unwrap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(engine.clone(), SECRET.into()));
    let app = http::router(AppState {
        engine,
        dispatcher,
        sources: Vec::new(),
        search_timeout: Duration::from_millis(250),
    });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, gateway)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn succeeded_payload(event_id: &str, intent_ref: &str, booking_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": {"object": {
            "id": intent_ref,
            "metadata": {"booking_id": booking_id},
            "amount": 20_000,
            "status": "succeeded"
        }}
    }))
    .unwrap()
}

async fn post_webhook(
    client: &reqwest::Client,
    addr: SocketAddr,
    body: Vec<u8>,
    signature: &str,
) -> reqwest::Response {
    client
        .post(format!("http://{addr}/webhooks/payment"))
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_end_to_end() {
    let (addr, gateway) = start_test_server().await;
    let client = reqwest::Client::new();

    let resource_id = Ulid::new().to_string();
    let user_id = Ulid::new().to_string();
    // Check-in 72 hours out: a cancellation lands in the free window.
    let check_in = now_ms() + 72 * MS_PER_HOUR;
    let check_out = check_in + 48 * MS_PER_HOUR;

    // Create: 200.00 EUR for two nights.
    let resp = client
        .post(format!("http://{addr}/bookings"))
        .json(&json!({
            "resource_id": resource_id,
            "user_id": user_id,
            "check_in": check_in,
            "check_out": check_out,
            "guests": 2,
            "amount_cents": 20_000,
            "currency": "EUR",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["status"], "pending");
    let booking_id = receipt["booking_id"].as_str().unwrap().to_string();
    let intent_ref = receipt["intent_ref"].as_str().unwrap().to_string();

    // The range is claimed while the hold is live.
    let resp = client
        .get(format!(
            "http://{addr}/resources/{resource_id}/availability?start={check_in}&end={check_out}"
        ))
        .send()
        .await
        .unwrap();
    let availability: Value = resp.json().await.unwrap();
    assert_eq!(availability["available"], false);

    // Payment succeeds out-of-band; the gateway calls back.
    let body = succeeded_payload("evt_flow_1", &intent_ref, &booking_id);
    let resp = post_webhook(&client, addr, body.clone(), &sign(&body, SECRET)).await;
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["outcome"], "processed");

    let resp = client
        .get(format!("http://{addr}/bookings/{booking_id}"))
        .send()
        .await
        .unwrap();
    let booking: Value = resp.json().await.unwrap();
    assert_eq!(booking["status"], "confirmed");
    assert!(booking["confirmation_number"].as_str().unwrap().starts_with("CR-"));

    // The stay shows up under its guest.
    let resp = client
        .get(format!("http://{addr}/users/{user_id}/bookings"))
        .send()
        .await
        .unwrap();
    let listed: Value = resp.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["booking_id"].as_str().unwrap(), booking_id);

    // Redelivery is acknowledged without side effects.
    let resp = post_webhook(&client, addr, body.clone(), &sign(&body, SECRET)).await;
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["outcome"], "duplicate");

    // Cancel at ~72 hours before check-in: full refund.
    let resp = client
        .delete(format!("http://{addr}/bookings/{booking_id}"))
        .json(&json!({"reason": "trip cancelled"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cancellation: Value = resp.json().await.unwrap();
    assert_eq!(cancellation["status"], "cancelled");
    assert_eq!(cancellation["terms"]["refund_pct"], 100);
    assert_eq!(cancellation["terms"]["refund_cents"], 20_000);
    assert_eq!(cancellation["refund_issued"], true);
    assert_eq!(gateway.issued_refunds().len(), 1);

    // The range is available again.
    let resp = client
        .get(format!(
            "http://{addr}/resources/{resource_id}/availability?start={check_in}&end={check_out}"
        ))
        .send()
        .await
        .unwrap();
    let availability: Value = resp.json().await.unwrap();
    assert_eq!(availability["available"], true);

    // A second cancel is rejected but still explains the terms.
    let resp = client
        .delete(format!("http://{addr}/bookings/{booking_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_STATUS_TRANSITION");
    assert!(err["terms"].is_object());
}

#[tokio::test]
async fn webhook_signature_is_enforced() {
    let (addr, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let body = succeeded_payload("evt_sig", "pi_x", &Ulid::new().to_string());

    let resp = post_webhook(&client, addr, body.clone(), &sign(&body, "wrong")).await;
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_SIGNATURE");

    // Missing header is rejected the same way.
    let resp = client
        .post(format!("http://{addr}/webhooks/payment"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn overlapping_booking_is_conflict() {
    let (addr, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let resource_id = Ulid::new().to_string();
    let check_in = now_ms() + 240 * MS_PER_HOUR;
    let check_out = check_in + 48 * MS_PER_HOUR;
    let request = json!({
        "resource_id": resource_id,
        "user_id": Ulid::new().to_string(),
        "check_in": check_in,
        "check_out": check_out,
        "guests": 2,
        "amount_cents": 20_000,
        "currency": "EUR",
    });

    let resp = client
        .post(format!("http://{addr}/bookings"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = client
        .post(format!("http://{addr}/bookings"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "NOT_AVAILABLE");
}

#[tokio::test]
async fn modify_confirmed_booking_over_http() {
    let (addr, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let resource_id = Ulid::new().to_string();
    let check_in = now_ms() + 240 * MS_PER_HOUR;
    let check_out = check_in + 48 * MS_PER_HOUR;

    let resp = client
        .post(format!("http://{addr}/bookings"))
        .json(&json!({
            "resource_id": resource_id,
            "user_id": Ulid::new().to_string(),
            "check_in": check_in,
            "check_out": check_out,
            "guests": 2,
            "amount_cents": 20_000,
            "currency": "EUR",
        }))
        .send()
        .await
        .unwrap();
    let receipt: Value = resp.json().await.unwrap();
    let booking_id = receipt["booking_id"].as_str().unwrap().to_string();
    let intent_ref = receipt["intent_ref"].as_str().unwrap().to_string();

    // A pending booking cannot be modified.
    let resp = client
        .patch(format!("http://{addr}/bookings/{booking_id}"))
        .json(&json!({"guests": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_STATUS_TRANSITION");
    assert!(err["terms"].is_object());

    let body = succeeded_payload("evt_modify", &intent_ref, &booking_id);
    post_webhook(&client, addr, body.clone(), &sign(&body, SECRET)).await;

    // Move the stay one day later.
    let resp = client
        .patch(format!("http://{addr}/bookings/{booking_id}"))
        .json(&json!({
            "check_in": check_in + 24 * MS_PER_HOUR,
            "check_out": check_out + 24 * MS_PER_HOUR,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let modified: Value = resp.json().await.unwrap();
    assert_eq!(modified["status"], "modified");

    // Old first night is free again; the shifted range is claimed.
    let old_first_night_end = check_in + 24 * MS_PER_HOUR;
    let resp = client
        .get(format!(
            "http://{addr}/resources/{resource_id}/availability?start={check_in}&end={old_first_night_end}"
        ))
        .send()
        .await
        .unwrap();
    let availability: Value = resp.json().await.unwrap();
    assert_eq!(availability["available"], true);
}

#[tokio::test]
async fn search_returns_empty_without_sources() {
    let (addr, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let resource_id = Ulid::new().to_string();
    let start = now_ms() + 240 * MS_PER_HOUR;
    let end = start + 48 * MS_PER_HOUR;
    let resp = client
        .get(format!(
            "http://{addr}/resources/{resource_id}/search?start={start}&end={end}"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let offers: Value = resp.json().await.unwrap();
    assert_eq!(offers, json!([]));
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let (addr, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/bookings/{}", Ulid::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "NOT_FOUND");
}
