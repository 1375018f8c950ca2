use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result, ServiceErrorCode};
use crate::money::round2;

/// Opaque reference to a stored payment method. The core never sees raw
/// card data; the payment-method provider owns that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodRef {
    pub id: String,
    /// Display label, e.g. "Visa •••• 4242".
    pub label: String,
}

/// Trip and insurance metadata attached to a payment intent, so the
/// payment service can record what the charge was for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeDetails {
    pub pickup_address: String,
    pub dropoff_address: String,
    pub vehicle_type: crate::trip::VehicleType,
    pub distance_miles: f64,
    pub item_description: String,
    pub insurance_quote_id: Option<String>,
    pub coverage_premium: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Idle,
    MethodRequired,
    CreatingIntent,
    AwaitingConfirmation,
    Confirming,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionError {
    pub code: ServiceErrorCode,
    pub message: String,
}

/// One payment attempt. Created fresh per booking attempt; once it reaches
/// `Failed` it is terminal and a new transaction must be created for any
/// retry, so stale intent identifiers never leak into a second attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub state: PaymentState,
    pub intent_id: Option<String>,
    pub client_secret: Option<String>,
    pub method: Option<PaymentMethodRef>,
    pub amount: f64,
    pub currency: String,
    pub last_error: Option<TransactionError>,
    /// Which attempt this transaction represents, starting at 0.
    pub retry_count: u32,
}

impl PaymentTransaction {
    fn new(amount: f64, currency: &str, retry_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: PaymentState::Idle,
            intent_id: None,
            client_secret: None,
            method: None,
            amount: round2(amount),
            currency: currency.to_string(),
            last_error: None,
            retry_count,
        }
    }

    fn fail(&mut self, code: ServiceErrorCode, message: impl Into<String>) {
        self.state = PaymentState::Failed;
        self.last_error = Some(TransactionError {
            code,
            message: message.into(),
        });
    }

    pub fn succeeded(&self) -> bool {
        self.state == PaymentState::Succeeded
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub amount: f64,
    pub currency: String,
    pub user_id: String,
    pub payment_method_id: String,
    pub details: ChargeDetails,
}

/// External payment processor: intent creation and confirmation.
#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<PaymentIntent>;
    async fn confirm(&self, client_secret: &str, payment_method_id: &str) -> Result<()>;
}

/// Supplies the customer's default stored payment method.
#[async_trait]
pub trait PaymentMethodProvider: Send + Sync {
    async fn default_method(&self, user_id: &str) -> Result<Option<PaymentMethodRef>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCreatePayment<'a> {
    amount: f64,
    currency: &'a str,
    user_id: &'a str,
    payment_method_id: &'a str,
    ride_details: &'a ChargeDetails,
}

#[derive(Debug, Deserialize)]
struct WireIntent {
    id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCreateResponse {
    success: bool,
    #[serde(default)]
    payment_intent: Option<WireIntent>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireConfirmPayment<'a> {
    client_secret: &'a str,
    payment_method_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireConfirmIntent {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConfirmResponse {
    success: bool,
    #[serde(default)]
    payment_intent: Option<WireConfirmIntent>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the payment service.
pub struct HttpPaymentService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentService for HttpPaymentService {
    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<PaymentIntent> {
        let wire = WireCreatePayment {
            amount: request.amount,
            currency: &request.currency,
            user_id: &request.user_id,
            payment_method_id: &request.payment_method_id,
            ride_details: &request.details,
        };

        let response = self
            .client
            .post(format!("{}/create-payment", self.base_url))
            .json(&wire)
            .send()
            .await
            .map_err(|e| FlowError::PaymentIntentFailed {
                code: ServiceErrorCode::Unclassified,
                message: e.to_string(),
            })?;

        let body: WireCreateResponse =
            response
                .json()
                .await
                .map_err(|e| FlowError::PaymentIntentFailed {
                    code: ServiceErrorCode::Unclassified,
                    message: e.to_string(),
                })?;

        match (body.success, body.payment_intent) {
            (true, Some(intent)) => Ok(PaymentIntent {
                id: intent.id,
                client_secret: intent.client_secret,
            }),
            _ => Err(FlowError::PaymentIntentFailed {
                code: ServiceErrorCode::from_wire(body.code.as_deref()),
                message: body
                    .error
                    .unwrap_or_else(|| "payment intent creation failed".to_string()),
            }),
        }
    }

    async fn confirm(&self, client_secret: &str, payment_method_id: &str) -> Result<()> {
        let wire = WireConfirmPayment {
            client_secret,
            payment_method_id,
        };

        let response = self
            .client
            .post(format!("{}/confirm-payment", self.base_url))
            .json(&wire)
            .send()
            .await
            .map_err(|e| FlowError::PaymentConfirmationFailed(e.to_string()))?;

        let body: WireConfirmResponse = response
            .json()
            .await
            .map_err(|e| FlowError::PaymentConfirmationFailed(e.to_string()))?;

        let status = body
            .payment_intent
            .as_ref()
            .map(|i| i.status.as_str())
            .unwrap_or_default();
        if body.success && status == "succeeded" {
            Ok(())
        } else if body.success {
            // Processor accepted the request but the intent has not
            // settled yet (e.g. "processing", "requires_action").
            Err(FlowError::PaymentNotSettled)
        } else {
            Err(FlowError::PaymentConfirmationFailed(
                body.error
                    .unwrap_or_else(|| format!("confirmation ended with status '{status}'")),
            ))
        }
    }
}

/// Drives one payment attempt through its state machine:
///
/// `Idle -> MethodRequired -> CreatingIntent -> Confirming ->
/// Succeeded | AwaitingConfirmation | Failed`
///
/// `AwaitingConfirmation` is where a transaction rests when the processor
/// reports the intent pending rather than settled; `Failed` is terminal
/// and any retry builds a fresh transaction.
///
/// The coordinator owns the transaction for its lifetime. Single-flight:
/// a second attempt for the same draft is rejected while one is running.
pub struct PaymentCoordinator {
    service: Arc<dyn PaymentService>,
    methods: Arc<dyn PaymentMethodProvider>,
    in_flight: bool,
    attempts: u32,
    last_transaction: Option<PaymentTransaction>,
}

impl PaymentCoordinator {
    pub fn new(service: Arc<dyn PaymentService>, methods: Arc<dyn PaymentMethodProvider>) -> Self {
        Self {
            service,
            methods,
            in_flight: false,
            attempts: 0,
            last_transaction: None,
        }
    }

    /// The most recent transaction, succeeded or failed. Failed ones are
    /// kept for error display only and are never re-driven.
    pub fn last_transaction(&self) -> Option<&PaymentTransaction> {
        self.last_transaction.as_ref()
    }

    /// A prior attempt that settled. Present when the charge went through
    /// but a later step (such as persisting the booking) failed; callers
    /// must reuse it instead of charging the customer again.
    pub fn settled_transaction(&self) -> Option<&PaymentTransaction> {
        self.last_transaction.as_ref().filter(|tx| tx.succeeded())
    }

    /// Run one full payment attempt for `amount`. Always builds a fresh
    /// transaction; a previous failure never leaks identifiers into this
    /// attempt. The override method, when given, takes precedence over the
    /// stored default (the "change payment method" recovery path).
    pub async fn execute(
        &mut self,
        user_id: &str,
        amount: f64,
        currency: &str,
        details: ChargeDetails,
        method_override: Option<PaymentMethodRef>,
    ) -> Result<PaymentTransaction> {
        if self.in_flight {
            return Err(FlowError::PaymentInFlight);
        }
        self.in_flight = true;
        let attempt = self.attempts;
        self.attempts += 1;
        let result = self
            .run_attempt(user_id, amount, currency, details, method_override, attempt)
            .await;
        self.in_flight = false;
        result
    }

    async fn run_attempt(
        &mut self,
        user_id: &str,
        amount: f64,
        currency: &str,
        details: ChargeDetails,
        method_override: Option<PaymentMethodRef>,
        attempt: u32,
    ) -> Result<PaymentTransaction> {
        let mut tx = PaymentTransaction::new(amount, currency, attempt);

        if tx.amount <= 0.0 {
            tx.fail(ServiceErrorCode::Unclassified, "non-positive amount");
            self.last_transaction = Some(tx);
            return Err(FlowError::InvalidAmount(amount));
        }

        // Resolve a payment method before any network call.
        let method = match method_override {
            Some(m) => Some(m),
            None => self.methods.default_method(user_id).await?,
        };
        let Some(method) = method else {
            tx.state = PaymentState::MethodRequired;
            self.last_transaction = Some(tx);
            return Err(FlowError::PaymentMethodMissing);
        };
        tx.method = Some(method.clone());

        tx.state = PaymentState::CreatingIntent;
        info!(tx_id = %tx.id, amount = tx.amount, attempt, "creating payment intent");
        let request = CreateIntentRequest {
            amount: tx.amount,
            currency: tx.currency.clone(),
            user_id: user_id.to_string(),
            payment_method_id: method.id.clone(),
            details,
        };
        let intent = match self.service.create_intent(&request).await {
            Ok(intent) => intent,
            Err(FlowError::PaymentIntentFailed { code, message }) => {
                error!(tx_id = %tx.id, %code, %message, "payment intent creation failed");
                tx.fail(code, message.clone());
                self.last_transaction = Some(tx);
                return Err(FlowError::PaymentIntentFailed { code, message });
            }
            Err(other) => {
                tx.fail(ServiceErrorCode::Unclassified, other.to_string());
                self.last_transaction = Some(tx);
                return Err(other);
            }
        };

        tx.intent_id = Some(intent.id.clone());
        tx.client_secret = Some(intent.client_secret.clone());

        tx.state = PaymentState::Confirming;
        match self.service.confirm(&intent.client_secret, &method.id).await {
            Ok(()) => {
                tx.state = PaymentState::Succeeded;
                info!(tx_id = %tx.id, intent_id = %intent.id, "payment succeeded");
                self.last_transaction = Some(tx.clone());
                Ok(tx)
            }
            Err(e) => {
                if dev_fallback_enabled() {
                    // Development-only escape hatch for working without a
                    // reachable payment backend. Compiled out of release
                    // builds and additionally gated on PAYMENT_DEV_FALLBACK.
                    warn!(tx_id = %tx.id, error = %e, "PAYMENT_DEV_FALLBACK active: treating confirmation as succeeded");
                    tx.state = PaymentState::Succeeded;
                    self.last_transaction = Some(tx.clone());
                    return Ok(tx);
                }
                if matches!(e, FlowError::PaymentNotSettled) {
                    // The intent is alive but pending; the transaction
                    // rests awaiting confirmation instead of failing.
                    warn!(tx_id = %tx.id, intent_id = %intent.id, "confirmation pending, intent not settled");
                    tx.state = PaymentState::AwaitingConfirmation;
                    self.last_transaction = Some(tx);
                    return Err(FlowError::PaymentNotSettled);
                }
                let message = e.to_string();
                error!(tx_id = %tx.id, %message, "payment confirmation failed");
                tx.fail(ServiceErrorCode::Unclassified, message.clone());
                self.last_transaction = Some(tx);
                Err(FlowError::PaymentConfirmationFailed(message))
            }
        }
    }
}

#[cfg(debug_assertions)]
fn dev_fallback_enabled() -> bool {
    std::env::var("PAYMENT_DEV_FALLBACK").is_ok_and(|v| v == "1")
}

#[cfg(not(debug_assertions))]
fn dev_fallback_enabled() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip::VehicleType;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn details() -> ChargeDetails {
        ChargeDetails {
            pickup_address: "100 Main St".to_string(),
            dropoff_address: "200 Oak Ave".to_string(),
            vehicle_type: VehicleType::CargoVan,
            distance_miles: 10.0,
            item_description: "sofa".to_string(),
            insurance_quote_id: None,
            coverage_premium: 0.0,
        }
    }

    struct StaticMethods(Option<PaymentMethodRef>);

    #[async_trait]
    impl PaymentMethodProvider for StaticMethods {
        async fn default_method(&self, _user_id: &str) -> Result<Option<PaymentMethodRef>> {
            Ok(self.0.clone())
        }
    }

    fn visa() -> PaymentMethodRef {
        PaymentMethodRef {
            id: "pm_123".to_string(),
            label: "Visa •••• 4242".to_string(),
        }
    }

    /// Scriptable payment service: each confirm call pops the next result.
    struct ScriptedPayments {
        intent_calls: AtomicU32,
        intent_error: Option<ServiceErrorCode>,
        confirm_results: Mutex<Vec<Result<()>>>,
    }

    impl ScriptedPayments {
        fn succeeding() -> Self {
            Self {
                intent_calls: AtomicU32::new(0),
                intent_error: None,
                confirm_results: Mutex::new(vec![Ok(())]),
            }
        }

        fn intent_rejected(code: ServiceErrorCode) -> Self {
            Self {
                intent_calls: AtomicU32::new(0),
                intent_error: Some(code),
                confirm_results: Mutex::new(Vec::new()),
            }
        }

        fn confirm_then(results: Vec<Result<()>>) -> Self {
            Self {
                intent_calls: AtomicU32::new(0),
                intent_error: None,
                confirm_results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl PaymentService for ScriptedPayments {
        async fn create_intent(&self, request: &CreateIntentRequest) -> Result<PaymentIntent> {
            let n = self.intent_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.intent_error {
                return Err(FlowError::PaymentIntentFailed {
                    code,
                    message: "rejected by processor".to_string(),
                });
            }
            Ok(PaymentIntent {
                id: format!("pi_{n}"),
                client_secret: format!("pi_{n}_secret_{}", request.payment_method_id),
            })
        }

        async fn confirm(&self, _client_secret: &str, _method: &str) -> Result<()> {
            let mut results = self.confirm_results.lock().unwrap();
            if results.is_empty() {
                return Err(FlowError::PaymentConfirmationFailed(
                    "no scripted result".to_string(),
                ));
            }
            results.remove(0)
        }
    }

    #[tokio::test]
    async fn missing_method_blocks_before_any_network_call() {
        let service = Arc::new(ScriptedPayments::succeeding());
        let mut coordinator =
            PaymentCoordinator::new(service.clone(), Arc::new(StaticMethods(None)));

        let err = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PaymentMethodMissing));
        assert_eq!(service.intent_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            coordinator.last_transaction().unwrap().state,
            PaymentState::MethodRequired
        );
    }

    #[tokio::test]
    async fn happy_path_reaches_succeeded_with_intent_stored() {
        let service = Arc::new(ScriptedPayments::succeeding());
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));

        let tx = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap();
        assert!(tx.succeeded());
        assert_eq!(tx.intent_id.as_deref(), Some("pi_0"));
        assert!(tx.client_secret.is_some());
        assert_eq!(tx.method.unwrap().id, "pm_123");
        assert_eq!(tx.retry_count, 0);
    }

    // Scenario: intent creation rejected with INSURANCE_REQUIRED. The code
    // must survive to the caller so the UI can react specifically.
    #[tokio::test]
    async fn intent_rejection_preserves_error_code() {
        let service = Arc::new(ScriptedPayments::intent_rejected(
            ServiceErrorCode::InsuranceRequired,
        ));
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));

        let err = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap_err();
        match err {
            FlowError::PaymentIntentFailed { code, .. } => {
                assert_eq!(code, ServiceErrorCode::InsuranceRequired)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let tx = coordinator.last_transaction().unwrap();
        assert_eq!(tx.state, PaymentState::Failed);
        assert_eq!(
            tx.last_error.as_ref().unwrap().code,
            ServiceErrorCode::InsuranceRequired
        );
    }

    #[tokio::test]
    async fn failed_transaction_is_never_reused_for_retry() {
        let service = Arc::new(ScriptedPayments::confirm_then(vec![
            Err(FlowError::PaymentConfirmationFailed(
                "card declined".to_string(),
            )),
            Ok(()),
        ]));
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));

        let err = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PaymentConfirmationFailed(_)));
        let failed_id = coordinator.last_transaction().unwrap().id;
        let failed_intent = coordinator
            .last_transaction()
            .unwrap()
            .intent_id
            .clone()
            .unwrap();

        let tx = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap();
        // Fresh transaction object, fresh intent, bumped attempt counter.
        assert_ne!(tx.id, failed_id);
        assert_ne!(tx.intent_id.as_deref().unwrap(), failed_intent);
        assert_eq!(tx.retry_count, 1);
        assert!(tx.succeeded());
    }

    // A processor "processing" response is not a failure: the transaction
    // rests awaiting confirmation with its intent intact, and it is never
    // treated as settled.
    #[tokio::test]
    async fn pending_confirmation_rests_awaiting_not_failed() {
        let service = Arc::new(ScriptedPayments::confirm_then(vec![Err(
            FlowError::PaymentNotSettled,
        )]));
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));

        let err = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PaymentNotSettled));

        let tx = coordinator.last_transaction().unwrap();
        assert_eq!(tx.state, PaymentState::AwaitingConfirmation);
        assert!(tx.intent_id.is_some());
        assert!(tx.last_error.is_none());
        assert!(coordinator.settled_transaction().is_none());
    }

    #[tokio::test]
    async fn second_attempt_rejected_while_one_is_in_flight() {
        let service = Arc::new(ScriptedPayments::succeeding());
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));
        coordinator.in_flight = true;

        let err = coordinator
            .execute("user-1", 108.53, "usd", details(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PaymentInFlight));
    }

    #[tokio::test]
    async fn zero_amount_is_rejected_before_method_lookup() {
        let service = Arc::new(ScriptedPayments::succeeding());
        let mut coordinator =
            PaymentCoordinator::new(service.clone(), Arc::new(StaticMethods(Some(visa()))));

        let err = coordinator
            .execute("user-1", 0.0, "usd", details(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidAmount(_)));
        assert_eq!(service.intent_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn method_override_takes_precedence_over_default() {
        let service = Arc::new(ScriptedPayments::succeeding());
        let mut coordinator =
            PaymentCoordinator::new(service, Arc::new(StaticMethods(Some(visa()))));

        let amex = PaymentMethodRef {
            id: "pm_amex".to_string(),
            label: "Amex •••• 0005".to_string(),
        };
        let tx = coordinator
            .execute("user-1", 108.53, "usd", details(), Some(amex))
            .await
            .unwrap();
        assert_eq!(tx.method.unwrap().id, "pm_amex");
    }
}
