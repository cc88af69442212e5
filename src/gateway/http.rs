use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use super::{GatewayClient, GatewayError, PaymentInitiation, PaymentInitiationRequest, RefundReceipt, RefundRequest};
use crate::domain::payment::PaymentMethod;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

/// JSON-over-HTTP processor: `POST {base}/payments` and `POST {base}/refunds`.
///
/// A 4xx answer carrying a reason is a decline. Anything else that is not a
/// 2xx counts against the circuit breaker.
pub struct HttpGateway {
    method: PaymentMethod,
    base_url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

#[derive(Debug, Deserialize)]
struct DeclineBody {
    reason: Option<String>,
}

impl HttpGateway {
    pub fn new(method: PaymentMethod, base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let name = match method {
            PaymentMethod::Card => "gateway-card",
            PaymentMethod::Wallet => "gateway-wallet",
            PaymentMethod::Balance => "gateway-balance",
        };

        Ok(Self {
            method,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            breaker: CircuitBreaker::new(name, CircuitBreakerConfig::default()),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: serde::Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let call = async {
            let response = self.client.post(&url).json(body).send().await.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Unavailable(e.to_string())
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| GatewayError::Protocol(e.to_string()));
            }

            if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                let reason = response
                    .json::<DeclineBody>()
                    .await
                    .ok()
                    .and_then(|b| b.reason)
                    .unwrap_or_else(|| status.to_string());
                return Err(GatewayError::Declined(reason));
            }

            Err(GatewayError::Unavailable(format!("{url} answered {status}")))
        };

        match self.breaker.call(call, |e: &GatewayError| !e.is_decline()).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen) => Err(GatewayError::CircuitOpen),
            Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, request: &PaymentInitiationRequest) -> Result<PaymentInitiation, GatewayError> {
        self.post("/payments", request).await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError> {
        self.post("/refunds", request).await
    }
}
