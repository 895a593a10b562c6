use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

use crate::engine::policy::{ModificationTerms, RefundTerms};
use crate::engine::{CreateBookingRequest, Engine, EngineError, ModifyRequest};
use crate::model::{Booking, Ms};
use crate::search::{self, Offer, PartnerSource};
use crate::webhook::Dispatcher;

/// Signature header attached by the payment gateway to webhook deliveries.
pub const SIGNATURE_HEADER: &str = "caravel-signature";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub dispatcher: Arc<Dispatcher>,
    pub sources: Vec<Arc<dyn PartnerSource>>,
    pub search_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/bookings", post(create_booking))
        .route(
            "/bookings/:id",
            get(get_booking).patch(modify_booking).delete(cancel_booking),
        )
        .route("/users/:id/bookings", get(list_user_bookings))
        .route("/resources/:id/availability", get(availability))
        .route("/resources/:id/search", get(search_offers))
        .route("/webhooks/payment", post(payment_webhook))
        .with_state(state)
}

// ── Error mapping ────────────────────────────────────────────────

/// Client-facing error: `{code, message}` plus refund/fee terms where a
/// rejected cancellation or modification must still explain itself.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    terms: Option<serde_json::Value>,
}

impl ApiError {
    fn with_terms(mut self, terms: serde_json::Value) -> Self {
        self.terms = Some(terms);
        self
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation(_) | EngineError::PolicyDenied(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NotAvailable { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::TransitionInFlight(_) => StatusCode::CONFLICT,
            EngineError::HoldExpired(_) => StatusCode::GONE,
            EngineError::InvalidSignature => StatusCode::BAD_REQUEST,
            EngineError::Gateway(_) => StatusCode::BAD_GATEWAY,
            EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
            terms: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(terms) = self.terms {
            body["terms"] = terms;
        }
        (self.status, Json(body)).into_response()
    }
}

// ── Request/response shapes ──────────────────────────────────────

#[derive(Debug, Serialize)]
struct BookingView {
    booking_id: Ulid,
    status: String,
    confirmation_number: Option<String>,
    resource_id: Ulid,
    user_id: Ulid,
    check_in: Ms,
    check_out: Ms,
    guests: u32,
    amount_cents: i64,
    currency: String,
    refund: Option<crate::model::RefundState>,
    history: Vec<crate::model::StatusEntry>,
}

/// Short reference printed on vouchers; only settled stays have one.
fn confirmation_number(booking: &Booking) -> Option<String> {
    use crate::model::BookingStatus::*;
    matches!(booking.status, Confirmed | Modified | Completed).then(|| {
        let id = booking.id.to_string();
        format!("CR-{}", &id[id.len() - 8..])
    })
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            booking_id: b.id,
            status: b.status.to_string(),
            confirmation_number: confirmation_number(&b),
            resource_id: b.resource_id,
            user_id: b.user_id,
            check_in: b.span.start,
            check_out: b.span.end,
            guests: b.guests,
            amount_cents: b.amount_cents,
            currency: b.currency.clone(),
            refund: b.refund,
            history: b.history,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Ms,
    end: Ms,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    reason: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn create_booking(
    State(state): State<AppState>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<crate::engine::BookingReceipt>), ApiError> {
    let receipt = state.engine.create_booking(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> Result<Json<BookingView>, ApiError> {
    let booking = state.engine.get_booking(id).await?;
    Ok(Json(booking.into()))
}

async fn list_user_bookings(
    State(state): State<AppState>,
    Path(user_id): Path<Ulid>,
) -> Json<Vec<BookingView>> {
    let bookings = state.engine.list_bookings_for_user(user_id).await;
    Json(bookings.into_iter().map(BookingView::from).collect())
}

async fn modify_booking(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(req): Json<ModifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.engine.modify_booking(id, req).await {
        Ok(receipt) => Ok(Json(json!({
            "booking_id": receipt.booking_id,
            "status": receipt.status,
            "check_in": receipt.span.start,
            "check_out": receipt.span.end,
            "guests": receipt.guests,
            "amount_cents": receipt.amount_cents,
            "change_fee_cents": receipt.change_fee_cents,
        }))),
        Err(e) => Err(attach_modification_terms(&state, id, e.into()).await),
    }
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    match state
        .engine
        .cancel_booking(id, reason, crate::model::Actor::Guest)
        .await
    {
        Ok(receipt) => Ok(Json(json!({
            "booking_id": receipt.booking_id,
            "status": receipt.status,
            "terms": receipt.terms,
            "refund_issued": receipt.refund_issued,
        }))),
        Err(e) => Err(attach_cancellation_terms(&state, id, e.into()).await),
    }
}

/// Rejected cancellations still explain the terms the caller would have
/// received, so the client can tell the end user why.
async fn attach_cancellation_terms(state: &AppState, id: Ulid, err: ApiError) -> ApiError {
    match state.engine.preview_cancellation(id).await {
        Ok(terms) => err.with_terms(terms_json(&terms)),
        Err(_) => err,
    }
}

async fn attach_modification_terms(state: &AppState, id: Ulid, err: ApiError) -> ApiError {
    match state.engine.preview_modification(id).await {
        Ok(terms) => err.with_terms(modification_terms_json(&terms)),
        Err(_) => err,
    }
}

fn terms_json(terms: &RefundTerms) -> serde_json::Value {
    json!({
        "refund_eligible": terms.eligible,
        "refund_cents": terms.refund_cents,
        "refund_pct": terms.refund_pct,
    })
}

fn modification_terms_json(terms: &ModificationTerms) -> serde_json::Value {
    json!({
        "allowed": terms.allowed,
        "reason": terms.reason,
        "change_fee_cents": terms.change_fee_cents,
    })
}

async fn availability(
    State(state): State<AppState>,
    Path(resource_id): Path<Ulid>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let available = state
        .engine
        .is_available(resource_id, range.start, range.end)
        .await?;
    Ok(Json(json!({
        "resource_id": resource_id,
        "start": range.start,
        "end": range.end,
        "available": available,
    })))
}

async fn search_offers(
    State(state): State<AppState>,
    Path(resource_id): Path<Ulid>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<Offer>>, ApiError> {
    if range.start >= range.end {
        return Err(EngineError::Validation("query end must be after start").into());
    }
    let offers = search::aggregate(
        &state.engine,
        &state.sources,
        resource_id,
        crate::model::Span::new(range.start, range.end),
        state.search_timeout,
    )
    .await;
    Ok(Json(offers))
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(EngineError::InvalidSignature)?;
    let ack = state.dispatcher.handle_event(&body, signature).await?;
    Ok(Json(json!({"received": true, "outcome": ack.as_str()})))
}
