//! Mercado Pago webhook reconciliation
//!
//! Turns provider notifications into at most one ledger effect per payment:
//!
//! 1. verify the `x-signature` header (failures answer `ignored`)
//! 2. keep only payment and merchant order topics
//! 3. resolve the payment id, asking the provider for the order's first payment
//! 4. fetch the payment; anything but `approved` answers `pending`
//! 5. skip payments already recorded on a wallet transaction or subscription
//! 6. queue a wallet credit, or activate the purchased plan
//!
//! Credits are applied by the job workers (see [`crate::jobs`]) which repeat
//! the step 5 check inside their own transaction.

use std::collections::HashMap;

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::database::{atomic, AppState};
use crate::error::WebhookError;
use crate::jobs::CreditRequest;
use crate::ledger;
use crate::model::{PlanId, UserId};
use crate::signature;
use crate::subscription;

const PAYMENT_TOPICS: [&str; 4] = ["payment", "approved", "payment.updated", "payment.created"];
const MERCHANT_ORDER_TOPICS: [&str; 2] = ["merchant_order", "topic_merchant_order_wh"];

/// What the webhook did with an event. Serialized as the `status` of the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ignored,
    WaitingPayment,
    Pending,
    AlreadyProcessed,
    Queued,
    SubscriptionActivated,
}

impl Outcome {
    pub fn status_code(self) -> StatusCode {
        match self {
            Outcome::Queued => StatusCode::ACCEPTED,
            _ => StatusCode::OK,
        }
    }
}

/// One inbound notification, already pulled apart from the HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookEvent {
    /// `topic` or `type`
    pub topic: Option<String>,
    /// `data.id`, the value covered by the signature
    pub data_id: Option<String>,
    /// Top level `id`
    pub id: Option<String>,
    /// `x-signature` header
    pub signature: Option<String>,
    /// `x-request-id` header
    pub request_id: Option<String>,
}

impl WebhookEvent {
    /// Reads the event fields from the body, falling back to the query string.
    pub fn from_parts(
        query: &HashMap<String, String>,
        body: &Value,
        signature: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        let from_query = |key: &str| query.get(key).filter(|v| !v.is_empty()).cloned();

        Self {
            topic: text(body.get("topic"))
                .or_else(|| text(body.get("type")))
                .or_else(|| from_query("topic"))
                .or_else(|| from_query("type")),
            data_id: from_query("data.id")
                .or_else(|| text(body.get("data").and_then(|data| data.get("id"))))
                .or_else(|| text(body.get("data.id"))),
            id: text(body.get("id")).or_else(|| from_query("id")),
            signature,
            request_id,
        }
    }

    /// Id of the resource the event is about.
    pub fn resource_id(&self) -> Option<&str> {
        self.data_id.as_deref().or(self.id.as_deref())
    }
}

/// Runs one event through the reconciliation steps.
pub async fn handle(state: &AppState, event: &WebhookEvent) -> Result<Outcome, WebhookError> {
    if let Err(e) = signature::verify(
        &state.config.mercado_pago_webhook_secret,
        event.signature.as_deref(),
        event.request_id.as_deref(),
        event.data_id.as_deref(),
    ) {
        warn!(reason = %e, "webhook signature rejected");
        return Ok(Outcome::Ignored);
    }

    let topic = event.topic.as_deref().unwrap_or_default();
    let payment_id = if MERCHANT_ORDER_TOPICS.contains(&topic) {
        let order_id = event
            .resource_id()
            .ok_or(WebhookError::MissingMerchantOrderId)?;
        let order = state.provider.merchant_order(order_id).await?;
        let Some(first) = order.payments.into_iter().next() else {
            info!(order_id = %order_id, "merchant order has no payments yet");
            return Ok(Outcome::WaitingPayment);
        };
        info!(order_id = %order_id, payment_id = %first.id, "merchant order resolved");
        first.id
    } else if PAYMENT_TOPICS.contains(&topic) {
        event
            .resource_id()
            .ok_or(WebhookError::MissingPaymentId)?
            .to_string()
    } else {
        info!(topic = %topic, "webhook topic ignored");
        return Ok(Outcome::Ignored);
    };

    let payment = state.provider.payment(&payment_id).await?;
    let purpose = payment
        .metadata
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    info!(
        payment_id = %payment_id,
        status = %payment.status,
        purpose = %purpose,
        "payment fetched"
    );

    if !payment.is_approved() {
        return Ok(Outcome::Pending);
    }

    if ledger::reference_recorded(&state.db, &payment_id)?
        || subscription::reference_recorded(&state.db, &payment_id)?
    {
        warn!(payment_id = %payment_id, "payment already processed");
        return Ok(Outcome::AlreadyProcessed);
    }

    match purpose.as_str() {
        "credits" => {
            let (Some(user_id), Some(amount)) = (
                metadata_number(&payment.metadata, "user_id"),
                metadata_number(&payment.metadata, "amount"),
            ) else {
                warn!(payment_id = %payment_id, "credit payment without user or amount");
                return Ok(Outcome::Ignored);
            };

            let request = CreditRequest {
                payment_id,
                user_id,
                amount,
            };
            state.jobs.enqueue_credit(&state.db, request).await?;
            Ok(Outcome::Queued)
        }
        "plan" | "subscription" => {
            let (Some(user_id), Some(plan_id)) = (
                metadata_number(&payment.metadata, "user_id"),
                metadata_number(&payment.metadata, "plan_id"),
            ) else {
                warn!(payment_id = %payment_id, "plan payment without user or plan");
                return Ok(Outcome::Ignored);
            };

            if activate(state, user_id, plan_id, &payment_id)? {
                Ok(Outcome::SubscriptionActivated)
            } else {
                Ok(Outcome::AlreadyProcessed)
            }
        }
        _ => {
            info!(payment_id = %payment_id, purpose = %purpose, "payment purpose ignored");
            Ok(Outcome::Ignored)
        }
    }
}

/// Activates the plan unless another delivery got there first.
fn activate(
    state: &AppState,
    user_id: UserId,
    plan_id: PlanId,
    payment_id: &str,
) -> Result<bool, WebhookError> {
    let activated = atomic(&state.db, |txn| {
        if subscription::reference_recorded_in(txn, payment_id)?
            || ledger::reference_recorded_in(txn, payment_id)?
        {
            return Ok(false);
        }
        subscription::activate_plan(txn, user_id, plan_id, true, None, Some(payment_id))?;
        Ok::<_, crate::error::SubscriptionError>(true)
    })?;
    Ok(activated)
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Metadata values come back as strings or numbers, sometimes with decimals.
fn metadata_number(metadata: &Map<String, Value>, key: &str) -> Option<u64> {
    let value = match metadata.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(whole))?,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole))?
        }
        _ => return None,
    };
    Some(value)
}

fn whole(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0 && f <= u64::MAX as f64).then(|| f.trunc() as u64)
}
