//! Payment gateway client.
//!
//! The engine only ever asks two things of the gateway: open an order for a
//! session's price, and report what actually happened to a payment. The
//! settlement path trusts the gateway's answer over anything the client sent.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unknown {entity} at gateway: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("unreadable gateway response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayPaymentStatus {
    Created,
    Authorized,
    Captured,
    Failed,
    Refunded,
    #[serde(other)]
    Unknown,
}

/// The gateway's view of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub order_id: String,
    pub amount: i64,
    pub currency: Option<String>,
    pub method: Option<String>,
    pub status: GatewayPaymentStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open an order for `amount` minor units. `receipt` is our reference.
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError>;

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;
}

// ── In-memory ────────────────────────────────────────────────

/// Gateway that lives in process. Used in development and tests; payments
/// are registered through [`InMemoryGateway::settle`].
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    orders: DashMap<String, GatewayOrder>,
    payments: DashMap<String, GatewayPayment>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of paying `order_id` and return the payment.
    pub fn settle(
        &self,
        order_id: &str,
        payment_id: &str,
        status: GatewayPaymentStatus,
    ) -> Result<GatewayPayment, GatewayError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| GatewayError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;
        let payment = GatewayPayment {
            id: payment_id.to_string(),
            order_id: order.id.clone(),
            amount: order.amount,
            currency: Some(order.currency.clone()),
            method: Some("card".into()),
            status,
        };
        self.payments.insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    pub fn order(&self, order_id: &str) -> Option<GatewayOrder> {
        self.orders.get(order_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let order = GatewayOrder {
            id: format!("order_{}", Ulid::new()),
            amount,
            currency: currency.to_string(),
            receipt: receipt.to_string(),
        };
        self.orders.insert(order.id.clone(), order.clone());
        tracing::debug!(order = %order.id, amount, "in-memory order created");
        Ok(order)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        self.payments
            .get(payment_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::NotFound {
                entity: "payment",
                id: payment_id.to_string(),
            })
    }
}

// ── HTTP ─────────────────────────────────────────────────────

/// REST gateway client, basic-auth with key id and secret.
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    key_id: String,
    key_secret: String,
    http_client: Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
            http_client: Client::new(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        entity: &'static str,
        id: &str,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound {
                entity,
                id: id.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("gateway {entity} request failed with {status}: {body}");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .http_client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount,
                currency,
                receipt,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        Self::decode(response, "order", receipt).await
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        let response = self
            .http_client
            .get(format!("{}/payments/{payment_id}", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        Self::decode(response, "payment", payment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_order_then_capture() {
        let gw = InMemoryGateway::new();
        let order = gw.create_order(5000, "INR", "session_1").await.unwrap();
        assert!(order.id.starts_with("order_"));

        gw.settle(&order.id, "pay_1", GatewayPaymentStatus::Captured)
            .unwrap();
        let p = gw.fetch_payment("pay_1").await.unwrap();
        assert_eq!(p.order_id, order.id);
        assert_eq!(p.amount, 5000);
        assert_eq!(p.status, GatewayPaymentStatus::Captured);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let gw = InMemoryGateway::new();
        assert!(matches!(
            gw.fetch_payment("pay_missing").await,
            Err(GatewayError::NotFound { entity: "payment", .. })
        ));
        assert!(gw.settle("order_missing", "p", GatewayPaymentStatus::Captured).is_err());
    }

    #[test]
    fn unknown_status_deserializes() {
        let p: GatewayPayment = serde_json::from_str(
            r#"{"id":"pay_1","order_id":"order_1","amount":100,"currency":"INR","method":null,"status":"disputed"}"#,
        )
        .unwrap();
        assert_eq!(p.status, GatewayPaymentStatus::Unknown);
    }
}
