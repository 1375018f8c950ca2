use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{delete, get, post},
};
use booking_flow::{
    Booking, BookingAssembler, BookingDraft, BookingStore, ChargeDetails, CoverageSelection,
    CustomerRef, DayOfWeek, DeliveryFeedback, DeliveryStatusPoller, FareSheet, FlowError, GeoPoint,
    HttpInsuranceService, HttpPaymentService, HttpPricingService, InMemoryBookingStore,
    InsuranceQuoteManager, InsuranceQuoteRequest, InsuranceService, ItemSummary,
    PaymentCoordinator, PaymentMethodProvider, PaymentMethodRef, PaymentService, PollerConfig,
    PricingClient, TrackingHandle, TrackingSnapshot, TripParameters, VehicleType, WeightClass,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Drafts whose client neither confirmed nor deleted them are swept once
/// they reach this age; otherwise the draft map only grows.
const DRAFT_TTL: Duration = Duration::from_secs(60 * 60);
const DRAFT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// One in-progress booking attempt. The mutex serializes all work on a
/// draft, which also enforces single-flight for payment attempts.
struct DraftEntry {
    draft: BookingDraft,
    insurance: InsuranceQuoteManager,
    payment: PaymentCoordinator,
    created_at: Instant,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn BookingStore>,
    pricing: Arc<PricingClient>,
    insurance_service: Arc<dyn InsuranceService>,
    payment_service: Arc<dyn PaymentService>,
    payment_methods: Arc<dyn PaymentMethodProvider>,
    drafts: Arc<DashMap<Uuid, Arc<Mutex<DraftEntry>>>>,
    trackers: Arc<DashMap<Uuid, TrackingHandle>>,
}

/// Default payment method configured at deploy time. Stands in for the
/// real payment-method provider; the core never sees raw card data either
/// way.
struct EnvPaymentMethods {
    method: Option<PaymentMethodRef>,
}

impl EnvPaymentMethods {
    fn from_env() -> Self {
        let method = std::env::var("DEFAULT_PAYMENT_METHOD_ID")
            .ok()
            .map(|id| PaymentMethodRef {
                id,
                label: "Default card".to_string(),
            });
        Self { method }
    }
}

#[async_trait]
impl PaymentMethodProvider for EnvPaymentMethods {
    async fn default_method(
        &self,
        _user_id: &str,
    ) -> booking_flow::Result<Option<PaymentMethodRef>> {
        Ok(self.method.clone())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(e: &FlowError) -> ApiError {
    let status = match e {
        FlowError::BookingNotFound(_) => StatusCode::NOT_FOUND,
        FlowError::DraftClosed => StatusCode::GONE,
        FlowError::PaymentInFlight => StatusCode::CONFLICT,
        FlowError::InvalidAmount(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::PaymentMethodMissing => StatusCode::PRECONDITION_FAILED,
        FlowError::BookingPersistFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            message: e.user_message(),
        }),
    )
}

fn not_found(what: &str, id: Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("{what} {id} not found"),
            message: "We couldn't find that booking.".to_string(),
        }),
    )
}

/// Initialize structured tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "booking_service=debug,booking_flow=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Middleware to add a correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let pricing_url =
        std::env::var("PRICING_SERVICE_URL").unwrap_or_else(|_| "http://localhost:4101".into());
    let insurance_url =
        std::env::var("INSURANCE_SERVICE_URL").unwrap_or_else(|_| "http://localhost:4102".into());
    let payment_url =
        std::env::var("PAYMENT_SERVICE_URL").unwrap_or_else(|_| "http://localhost:4103".into());
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let http = reqwest::Client::new();
    let state = AppState {
        store: Arc::new(InMemoryBookingStore::new()),
        pricing: Arc::new(PricingClient::new(Arc::new(HttpPricingService::new(
            http.clone(),
            pricing_url,
        )))),
        insurance_service: Arc::new(HttpInsuranceService::new(http.clone(), insurance_url)),
        payment_service: Arc::new(HttpPaymentService::new(http, payment_url)),
        payment_methods: Arc::new(EnvPaymentMethods::from_env()),
        drafts: Arc::new(DashMap::new()),
        trackers: Arc::new(DashMap::new()),
    };

    let drafts = state.drafts.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DRAFT_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            drafts.retain(|id, entry| {
                // A locked entry is in active use; skip it this sweep.
                let Ok(mut entry) = entry.try_lock() else {
                    return true;
                };
                if entry.created_at.elapsed() < DRAFT_TTL {
                    return true;
                }
                entry.draft.close();
                info!(draft_id = %id, "expired draft swept");
                false
            });
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/drafts", post(create_draft))
        .route("/drafts/{id}/price", post(price_draft))
        .route("/drafts/{id}/coverage", post(set_coverage))
        .route("/drafts/{id}/confirm", post(confirm_draft))
        .route("/drafts/{id}", delete(abandon_draft))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/feedback", post(leave_feedback))
        .route("/bookings/{id}/tracking", get(get_tracking))
        .route("/bookings/{id}/tracking/refresh", post(refresh_tracking))
        .route("/bookings/{id}/tracking/view", post(toggle_tracking_view))
        .layer(from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server running on http://{bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDraftRequest {
    user_id: String,
    email: String,
    vehicle_type: VehicleType,
    pickup: GeoPoint,
    pickup_address: String,
    dropoff: GeoPoint,
    dropoff_address: String,
    distance_miles: f64,
    duration_minutes: f64,
    hour_of_day: u8,
    day_of_week: DayOfWeek,
    help_needed: bool,
    item_weight: WeightClass,
    item_description: String,
    declared_value: Option<f64>,
    scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDraftResponse {
    draft_id: Uuid,
}

async fn create_draft(
    State(state): State<AppState>,
    Json(request): Json<CreateDraftRequest>,
) -> Result<Json<CreateDraftResponse>, ApiError> {
    let trip = TripParameters {
        vehicle_type: request.vehicle_type,
        pickup: request.pickup,
        dropoff: request.dropoff,
        distance_miles: request.distance_miles,
        duration_minutes: request.duration_minutes,
        hour_of_day: request.hour_of_day,
        day_of_week: request.day_of_week,
        help_needed: request.help_needed,
        item_weight: request.item_weight,
    };
    let mut draft = BookingDraft::new(
        CustomerRef {
            user_id: request.user_id,
            email: request.email,
        },
        trip,
        ItemSummary {
            description: request.item_description,
            declared_value: request.declared_value,
        },
        request.pickup_address,
        request.dropoff_address,
    );
    draft.scheduled_at = request.scheduled_at;

    let draft_id = draft.id;
    let entry = DraftEntry {
        draft,
        insurance: InsuranceQuoteManager::new(state.insurance_service.clone()),
        payment: PaymentCoordinator::new(
            state.payment_service.clone(),
            state.payment_methods.clone(),
        ),
        created_at: Instant::now(),
    };
    state.drafts.insert(draft_id, Arc::new(Mutex::new(entry)));
    info!(%draft_id, "booking draft created");
    Ok(Json(CreateDraftResponse { draft_id }))
}

fn draft_entry(state: &AppState, id: Uuid) -> Result<Arc<Mutex<DraftEntry>>, ApiError> {
    state
        .drafts
        .get(&id)
        .map(|entry| entry.clone())
        .ok_or_else(|| not_found("draft", id))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PriceDraftRequest {
    #[serde(default)]
    include_coverage: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PriceDraftResponse {
    fares: FareSheet,
    coverage: CoverageSelection,
    can_confirm: bool,
    coverage_error: Option<String>,
}

/// Price the draft: live fares and (optionally) an insurance quote are
/// fetched concurrently; the draft tolerates either resolving first.
async fn price_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    request: Option<Json<PriceDraftRequest>>,
) -> Result<Json<PriceDraftResponse>, ApiError> {
    let include_coverage = request.map(|Json(r)| r.include_coverage).unwrap_or(false);
    let entry = draft_entry(&state, id)?;
    let mut entry = entry.lock().await;

    let trip = entry.draft.trip.clone();
    let quote_request = InsuranceQuoteRequest {
        trip: trip.clone(),
        item_value: entry.draft.item.declared_value.unwrap_or(0.0),
        user_email: entry.draft.customer.email.clone(),
    };

    let mut coverage_error = None;
    let sheet = if include_coverage {
        let (sheet, quoted) = tokio::join!(
            state.pricing.quote_or_fallback(&trip, &VehicleType::ALL),
            entry.insurance.enable(&quote_request),
        );
        if let Err(e) = quoted {
            coverage_error = Some(e.user_message());
        }
        sheet
    } else {
        state.pricing.quote_or_fallback(&trip, &VehicleType::ALL).await
    };

    entry
        .draft
        .apply_fares(sheet.clone())
        .map_err(|e| api_error(&e))?;
    let selection = entry.insurance.selection();
    entry
        .draft
        .apply_coverage(selection.clone())
        .map_err(|e| api_error(&e))?;

    Ok(Json(PriceDraftResponse {
        fares: sheet,
        coverage: selection,
        can_confirm: entry.insurance.can_confirm(),
        coverage_error,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetCoverageRequest {
    included: bool,
    #[serde(default)]
    retry: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetCoverageResponse {
    coverage: CoverageSelection,
    can_confirm: bool,
    coverage_error: Option<String>,
}

async fn set_coverage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetCoverageRequest>,
) -> Result<Json<SetCoverageResponse>, ApiError> {
    let entry = draft_entry(&state, id)?;
    let mut entry = entry.lock().await;

    let quote_request = InsuranceQuoteRequest {
        trip: entry.draft.trip.clone(),
        item_value: entry.draft.item.declared_value.unwrap_or(0.0),
        user_email: entry.draft.customer.email.clone(),
    };

    let mut coverage_error = None;
    if request.included {
        let result = if request.retry {
            entry.insurance.retry(&quote_request).await
        } else {
            entry.insurance.enable(&quote_request).await
        };
        if let Err(e) = result {
            coverage_error = Some(e.user_message());
        }
    } else {
        entry.insurance.disable();
    }

    let selection = entry.insurance.selection();
    entry
        .draft
        .apply_coverage(selection.clone())
        .map_err(|e| api_error(&e))?;

    Ok(Json(SetCoverageResponse {
        coverage: selection,
        can_confirm: entry.insurance.can_confirm(),
        coverage_error,
    }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfirmDraftRequest {
    /// The "change payment method" recovery path.
    payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmDraftResponse {
    booking_id: Uuid,
    total: f64,
}

/// Payment, assembly, and poller start for one draft. Ordering: a valid
/// fare must exist before the intent is created, payment must succeed
/// before assembly, and the poller only starts once the booking has an id.
async fn confirm_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    request: Option<Json<ConfirmDraftRequest>>,
) -> Result<Json<ConfirmDraftResponse>, ApiError> {
    let method_override = request
        .and_then(|Json(r)| r.payment_method_id)
        .map(|id| PaymentMethodRef {
            id,
            label: "Selected card".to_string(),
        });
    let entry = draft_entry(&state, id)?;
    let mut entry = entry.lock().await;

    if entry.draft.is_closed() {
        return Err(api_error(&FlowError::DraftClosed));
    }

    // Payment may already have settled on an earlier confirm whose persist
    // step failed; reuse that transaction rather than charging again.
    let transaction = match entry.payment.settled_transaction().cloned() {
        Some(tx) => {
            info!(draft_id = %id, tx_id = %tx.id, "reusing settled payment from a previous attempt");
            tx
        }
        None => {
            // Insurance errors block confirmation; coverage is resolved
            // or retried first.
            if !entry.insurance.can_confirm() {
                let e = FlowError::InsuranceUnavailable {
                    code: booking_flow::ServiceErrorCode::InsuranceRequired,
                    message: "insurance quote unresolved".to_string(),
                };
                return Err(api_error(&e));
            }

            let fare = entry.draft.confirmation_fare().map_err(|e| api_error(&e))?;
            let details = ChargeDetails {
                pickup_address: entry.draft.pickup_address.clone(),
                dropoff_address: entry.draft.dropoff_address.clone(),
                vehicle_type: entry.draft.trip.vehicle_type,
                distance_miles: entry.draft.trip.distance_miles,
                item_description: entry.draft.item.description.clone(),
                insurance_quote_id: entry
                    .draft
                    .coverage()
                    .quote
                    .as_ref()
                    .map(|q| q.quote_id.clone()),
                coverage_premium: entry.draft.coverage().applied_premium(),
            };

            let user_id = entry.draft.customer.user_id.clone();
            entry
                .payment
                .execute(&user_id, fare.total(), "usd", details, method_override)
                .await
                .map_err(|e| {
                    error!(draft_id = %id, error = %e, "payment attempt failed");
                    api_error(&e)
                })?
        }
    };

    let assembler = BookingAssembler::new(state.store.clone());
    let booking_id = assembler
        .submit(&entry.draft, &transaction)
        .await
        .map_err(|e| api_error(&e))?;
    entry.draft.close();

    let handle = DeliveryStatusPoller::spawn(
        state.store.clone(),
        booking_id,
        booking_flow::DeliveryStatus::Accepted,
        PollerConfig::default(),
        move |completed_id| {
            info!(booking_id = %completed_id, "delivery completed");
        },
    );
    state.trackers.insert(booking_id, handle.clone());
    // Release the tracker on any stop: completion, cancellation, the
    // failure threshold, or an explicit stop command.
    let trackers = state.trackers.clone();
    let mut stopped = handle.watch();
    tokio::spawn(async move {
        while !stopped.borrow().stopped {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        trackers.remove(&booking_id);
        info!(booking_id = %booking_id, "tracker released");
    });
    state.drafts.remove(&id);

    info!(%booking_id, total = transaction.amount, "booking confirmed");
    Ok(Json(ConfirmDraftResponse {
        booking_id,
        total: transaction.amount,
    }))
}

async fn abandon_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let entry = draft_entry(&state, id)?;
    {
        let mut entry = entry.lock().await;
        // Closing first means in-flight pricing/insurance results for this
        // draft are discarded when they land.
        entry.draft.close();
    }
    state.drafts.remove(&id);
    info!(draft_id = %id, "draft abandoned");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, ApiError> {
    match state.store.get(id).await {
        Ok(Some(booking)) => Ok(Json(booking)),
        Ok(None) => Err(not_found("booking", id)),
        Err(e) => Err(api_error(&e)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest {
    rating: u8,
    comment: Option<String>,
}

async fn leave_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<FeedbackRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .set_feedback(
            id,
            DeliveryFeedback {
                rating: request.rating.min(5),
                comment: request.comment,
            },
        )
        .await
        .map_err(|e| api_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_tracking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackingSnapshot>, ApiError> {
    if let Some(handle) = state.trackers.get(&id) {
        return Ok(Json(handle.snapshot()));
    }
    // No live tracker (completed or restarted): serve the stored status.
    match state.store.get(id).await {
        Ok(Some(booking)) => Ok(Json(TrackingSnapshot {
            booking_id: id,
            status: booking.status,
            view: booking_flow::TrackingView::Compact,
            consecutive_failures: 0,
            last_error: None,
            stopped: true,
        })),
        Ok(None) => Err(not_found("booking", id)),
        Err(e) => Err(api_error(&e)),
    }
}

async fn refresh_tracking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .trackers
        .get(&id)
        .map(|h| h.clone())
        .ok_or_else(|| not_found("tracker for booking", id))?;
    if !handle.refresh_now().await {
        // The loop already gave up; a refresh can no longer be delivered.
        return Err((
            StatusCode::GONE,
            Json(ErrorBody {
                error: format!("tracking for booking {id} has stopped"),
                message: "Live tracking for this delivery has ended. Check the booking for its final status.".to_string(),
            }),
        ));
    }
    Ok(StatusCode::ACCEPTED)
}

async fn toggle_tracking_view(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackingSnapshot>, ApiError> {
    let handle = state
        .trackers
        .get(&id)
        .map(|h| h.clone())
        .ok_or_else(|| not_found("tracker for booking", id))?;
    handle.toggle_view().await;
    Ok(Json(handle.snapshot()))
}
