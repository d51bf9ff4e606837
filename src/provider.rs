//! Payment provider client
//!
//! Minimal client for the Mercado Pago REST API (https://api.mercadopago.com).
//! Authorization: `Authorization: Bearer <access token>`.
//!
//! Reconciliation only talks to [`PaymentProvider`], so tests can swap the
//! HTTP client for an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::ProviderError;

/// Payment as reported by the provider.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Payment {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    /// `approved`, `pending`, `rejected`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Payment {
    pub fn is_approved(&self) -> bool {
        self.status == "approved"
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MerchantOrderPayment {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MerchantOrder {
    #[serde(default)]
    pub payments: Vec<MerchantOrderPayment>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    pub currency_id: String,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Body of "create checkout preference".
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckoutPreference {
    pub items: Vec<PreferenceItem>,
    pub back_urls: BackUrls,
    pub auto_return: String,
    /// Values are sent as strings and come back that way on the payment
    pub metadata: Map<String, Value>,
    pub notification_url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Preference {
    pub id: String,
    pub init_point: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn payment(&self, payment_id: &str) -> Result<Payment, ProviderError>;

    async fn merchant_order(&self, order_id: &str) -> Result<MerchantOrder, ProviderError>;

    async fn create_preference(
        &self,
        preference: &CheckoutPreference,
    ) -> Result<Preference, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct MercadoPagoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl MercadoPagoClient {
    pub fn new(base_url: &str, access_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ProviderError> {
        debug!(path = %path, "mercado pago request");
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        decode(resp).await
    }
}

#[async_trait]
impl PaymentProvider for MercadoPagoClient {
    async fn payment(&self, payment_id: &str) -> Result<Payment, ProviderError> {
        self.get(&format!("/v1/payments/{payment_id}")).await
    }

    async fn merchant_order(&self, order_id: &str) -> Result<MerchantOrder, ProviderError> {
        self.get(&format!("/merchant_orders/{order_id}")).await
    }

    async fn create_preference(
        &self,
        preference: &CheckoutPreference,
    ) -> Result<Preference, ProviderError> {
        info!(
            title = %preference.items.first().map(|i| i.title.as_str()).unwrap_or_default(),
            "creating checkout preference"
        );
        let resp = self
            .http
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(preference)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, ProviderError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str::<T>(&body)
        .map_err(|e| ProviderError::InvalidResponse(format!("{e}; body={body}")))
}

/// Provider ids arrive as numbers or strings.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_ids_may_be_numbers() {
        let payment: Payment = serde_json::from_str(
            r#"{"id": 123456789, "status": "approved", "metadata": {"type": "credits", "user_id": "7"}}"#,
        )
        .unwrap();
        assert_eq!(payment.id, "123456789");
        assert!(payment.is_approved());
        assert_eq!(payment.metadata["user_id"], "7");

        let order: MerchantOrder =
            serde_json::from_str(r#"{"id": 1, "payments": [{"id": "abc"}, {"id": 2}]}"#).unwrap();
        let ids: Vec<&str> = order.payments.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["abc", "2"]);
    }

    #[test]
    fn missing_fields_default() {
        let payment: Payment = serde_json::from_str(r#"{"id": "1"}"#).unwrap();
        assert!(!payment.is_approved());
        assert!(payment.metadata.is_empty());

        let order: MerchantOrder = serde_json::from_str("{}").unwrap();
        assert!(order.payments.is_empty());
    }
}
