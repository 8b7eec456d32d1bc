//! Carrier-rate boundary: quote fetching at the rate-selection step.
//!
//! The engine only requires that the call happen at a suspension point and
//! that failure trigger the revert path; everything carrier-specific stays
//! behind [`RateProvider`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Shipment parameters extracted from a completed data-collection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub from_zip: String,
    pub to_zip: String,
    pub weight_kg: String,
    pub dimensions_cm: String,
}

/// One purchasable rate offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    pub id: String,
    pub carrier: String,
    pub service: String,
    pub price: Decimal,
    pub currency: String,
    pub eta_days: u32,
}

/// External rate/carrier API.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn fetch_rates(&self, shipment: &Shipment) -> Result<Vec<RateQuote>, FlowError>;
}

/// HTTP rate-shop client.
pub struct HttpRateProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRateProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn fetch_rates(&self, shipment: &Shipment) -> Result<Vec<RateQuote>, FlowError> {
        let external = |reason: String| FlowError::External {
            step: "rate_select".to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(shipment)
            .send()
            .await
            .map_err(|e| external(e.to_string()))?;

        if !response.status().is_success() {
            return Err(external(format!("rate API returned {}", response.status())));
        }

        let quotes: Vec<RateQuote> = response
            .json()
            .await
            .map_err(|e| external(e.to_string()))?;
        if quotes.is_empty() {
            return Err(external("rate API returned no quotes".to_string()));
        }
        Ok(quotes)
    }
}
