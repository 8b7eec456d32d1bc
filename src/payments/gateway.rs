//! Payment-gateway boundary: invoice creation.
//!
//! Only the interface the conversation engine needs. Request/response
//! internals of any concrete processor stay behind the trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::payments::PaymentKind;

/// A freshly created invoice the user can pay.
#[derive(Debug, Clone)]
pub struct Invoice {
    /// Processor correlation id echoed back by the status webhook.
    pub track_id: String,
    /// Where the user goes to pay.
    pub pay_url: String,
}

/// External payment processor, invoked at a suspension point.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(
        &self,
        user_id: &str,
        amount: Decimal,
        currency: &str,
        kind: PaymentKind,
    ) -> Result<Invoice, PaymentError>;
}

/// HTTP gateway client for a hosted-invoice processor.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    track_id: String,
    pay_url: String,
}

impl HttpPaymentGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_invoice(
        &self,
        user_id: &str,
        amount: Decimal,
        currency: &str,
        kind: PaymentKind,
    ) -> Result<Invoice, PaymentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "order_id": Uuid::new_v4(),
                "user_id": user_id,
                "amount": amount.to_string(),
                "currency": currency,
                "kind": kind.as_str(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::InvoiceFailed {
                reason: format!("gateway returned {}", response.status()),
            });
        }

        let body: InvoiceResponse = response.json().await?;
        Ok(Invoice {
            track_id: body.track_id,
            pay_url: body.pay_url,
        })
    }
}
