// ============================================================================
// Payment Gateways
// ============================================================================
//
// One client per external method (card, wallet). Balance payments never leave
// the process and have no client. Every call runs under a timeout; nothing in
// this module retries. A timeout is reported as such so the payment can stay
// `pending` while the caller polls.
//
// ============================================================================

pub mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::payment::PaymentMethod;
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Definitive negative answer; the payment will not succeed.
    #[error("Declined by gateway: {0}")]
    Declined(String),

    #[error("Gateway call timed out")]
    Timeout,

    #[error("Gateway unreachable: {0}")]
    Unavailable(String),

    #[error("Gateway circuit open")]
    CircuitOpen,

    #[error("Unexpected gateway response: {0}")]
    Protocol(String),
}

impl GatewayError {
    pub fn is_decline(&self) -> bool {
        matches!(self, GatewayError::Declined(_))
    }

    fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Declined(_) => "declined",
            GatewayError::Timeout => "timeout",
            GatewayError::CircuitOpen => "circuit_open",
            GatewayError::Unavailable(_) | GatewayError::Protocol(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInitiationRequest {
    pub payment_no: String,
    pub order_no: String,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
}

/// Method-specific data the client needs to finish paying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentInitiation {
    Redirect { url: String },
    QrCode { payload: String },
    /// Settled synchronously (balance payments)
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Deterministic per slice; the gateway deduplicates on it
    pub refund_no: String,
    pub payment_no: String,
    pub third_party_ref: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_no: String,
    pub gateway_ref: Option<String>,
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn initiate(&self, request: &PaymentInitiationRequest) -> Result<PaymentInitiation, GatewayError>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError>;
}

/// Routes calls to the client registered for a method, under a timeout.
#[derive(Clone)]
pub struct GatewayRegistry {
    clients: HashMap<PaymentMethod, Arc<dyn GatewayClient>>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl GatewayRegistry {
    pub fn new(timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            clients: HashMap::new(),
            timeout,
            metrics,
        }
    }

    pub fn register(&mut self, client: Arc<dyn GatewayClient>) {
        tracing::info!(method = %client.method(), "Registered payment gateway");
        self.clients.insert(client.method(), client);
    }

    pub fn with(mut self, client: Arc<dyn GatewayClient>) -> Self {
        self.register(client);
        self
    }

    fn client(&self, method: PaymentMethod) -> Result<&Arc<dyn GatewayClient>, GatewayError> {
        self.clients
            .get(&method)
            .ok_or_else(|| GatewayError::Unavailable(format!("no gateway configured for {method}")))
    }

    pub async fn initiate(&self, request: &PaymentInitiationRequest) -> Result<PaymentInitiation, GatewayError> {
        let client = self.client(request.method)?;
        let result = match tokio::time::timeout(self.timeout, client.initiate(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };
        self.record(request.method, "initiate", &result);
        result
    }

    pub async fn refund(&self, method: PaymentMethod, request: &RefundRequest) -> Result<RefundReceipt, GatewayError> {
        let client = self.client(method)?;
        let result = match tokio::time::timeout(self.timeout, client.refund(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };
        self.record(method, "refund", &result);
        result
    }

    fn record<T>(&self, method: PaymentMethod, call: &str, result: &Result<T, GatewayError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => {
                tracing::warn!(method = %method, call, error = %e, "Gateway call failed");
                e.outcome()
            }
        };
        self.metrics.record_gateway_call(method.as_str(), call, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGateway;

    fn request(method: PaymentMethod) -> PaymentInitiationRequest {
        PaymentInitiationRequest {
            payment_no: "P1".into(),
            order_no: "1".into(),
            amount: Decimal::from(10),
            method,
            return_url: None,
            notify_url: None,
        }
    }

    fn registry(timeout: Duration, gateway: Arc<MockGateway>) -> GatewayRegistry {
        GatewayRegistry::new(timeout, Arc::new(Metrics::new().unwrap())).with(gateway)
    }

    #[tokio::test]
    async fn test_routes_to_registered_method() {
        let gateway = Arc::new(MockGateway::new(PaymentMethod::Card));
        let registry = registry(Duration::from_secs(1), gateway.clone());

        let initiation = registry.initiate(&request(PaymentMethod::Card)).await.unwrap();
        assert!(matches!(initiation, PaymentInitiation::Redirect { .. }));
        assert_eq!(gateway.initiated().await, vec!["P1".to_string()]);
    }

    #[tokio::test]
    async fn test_unregistered_method_is_unavailable() {
        let registry = registry(Duration::from_secs(1), Arc::new(MockGateway::new(PaymentMethod::Card)));
        let result = registry.initiate(&request(PaymentMethod::Wallet)).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let gateway = Arc::new(MockGateway::new(PaymentMethod::Card).with_delay(Duration::from_millis(200)));
        let registry = registry(Duration::from_millis(20), gateway);

        let result = registry.initiate(&request(PaymentMethod::Card)).await;
        assert_eq!(result, Err(GatewayError::Timeout));
    }

    #[test]
    fn test_initiation_serializes_tagged() {
        let json = serde_json::to_value(PaymentInitiation::QrCode { payload: "weixin://x".into() }).unwrap();
        assert_eq!(json["kind"], "qr_code");
        assert_eq!(json["payload"], "weixin://x");
    }
}
