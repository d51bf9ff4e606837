//! HTTP request handlers
//!
//! This module wires the HTTP surface to the services:
//! - Creating, listing, deleting and following short URLs
//! - Registering users and reading wallets
//! - Refunds, plans, subscriptions and checkout
//! - The Mercado Pago webhook
//!
//! Handlers stay thin: they pull the request apart, call one service function
//! and shape the reply. Failures are returned as [`AppError`].

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::accounts;
use crate::database::{atomic, AppState};
use crate::error::{AppError, LedgerError, SubscriptionError};
use crate::ledger;
use crate::model::{
    CheckoutItem, CheckoutRequest, CheckoutResponse, DeleteParams, InterstitialResponse,
    ListParams, NewPlan, RegisterRequest, RegisterResponse, ShortenRequest, ShortenResponse,
    ShortenResult, SubscriptionId, TransactionId, UrlMetadata, UserId, WalletResponse,
};
use crate::pricing;
use crate::provider::{BackUrls, CheckoutPreference, PreferenceItem};
use crate::reconcile::{self, WebhookEvent};
use crate::shortening::{self, ShortenCommand};
use crate::subscription;

/// Address reported when the request carries no forwarding headers
const UNKNOWN_IP: &str = "0.0.0.0";

/// Creates a new short URL
///
/// This handler:
/// 1. Applies the daily quota to anonymous submissions
/// 2. Returns an identical earlier link when one exists (unless `create_new`)
/// 3. Otherwise debits the creator and mints a new link in one transaction
///
/// # Request Body
///
/// ```json
/// {
///   "url": "https://example.com/very/long/url",
///   "user_id": 7,
///   "is_direct": true,
///   "is_permanent": false
/// }
/// ```
///
/// # Response
///
/// - **201 Created** - A new link was minted
/// - **200 OK** - An identical link already existed; nothing was charged
/// - **402 Payment Required** - Not enough coins in the wallet
/// - **429 Too Many Requests** - Anonymous daily quota used up
pub async fn create_short_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ShortenRequest>,
) -> Result<Response, AppError> {
    let ip = client_ip(&headers);

    if payload.user_id.is_none() {
        let since = Utc::now() - Duration::hours(24);
        let created = shortening::anonymous_links_since(&state.db, &ip, since)?;
        if created >= state.config.anonymous_daily_limit {
            return Err(AppError::TooManyRequests(format!(
                "anonymous users may create {} links per day",
                state.config.anonymous_daily_limit
            )));
        }
    }

    let command = ShortenCommand {
        user_id: payload.user_id,
        client_ip: &ip,
        original_url: &payload.url,
        metadata: UrlMetadata {
            is_direct: payload.is_direct,
            is_permanent: payload.is_permanent,
        },
        create_new: payload.create_new,
    };
    let shortened = shortening::shorten(&state.db, &state.codec, &state.config, &command)?;

    let status = match shortened.result {
        ShortenResult::Created => StatusCode::CREATED,
        ShortenResult::Exists => StatusCode::OK,
    };
    let url = shortened.url;
    let response = ShortenResponse {
        short_code: url.short_code,
        short_url: url.short_url,
        original_url: url.original_url,
        result: shortened.result,
        charged: shortened.charged,
        is_direct: url.metadata.is_direct,
        is_permanent: url.metadata.is_permanent,
        created_at: url.created_at,
        expires_at: url.expires_at,
    };

    Ok((status, Json(response)).into_response())
}

/// Follows a short URL
///
/// When a user visits `http://localhost:8080/abc123`, this handler looks up
/// "abc123", records the click and either redirects or asks for confirmation.
///
/// # Response
///
/// - **307 Temporary Redirect** - Direct links, and links whose owner's plan
///   disables the confirmation page
/// - **200 OK** - Interstitial body with `confirm_required: true`
/// - **404 Not Found** - Unknown code
/// - **410 Gone** - The link has expired
///
/// # Note
///
/// Uses 307 Temporary Redirect instead of 301 Permanent Redirect so that
/// browsers keep coming back and every click is counted.
pub async fn redirect_url(
    Path(code): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let resolution =
        shortening::resolve(&state.db, &state.codec, &code, &client_ip(&headers), Utc::now())?;

    if resolution.direct {
        return Ok(Redirect::temporary(&resolution.url.original_url).into_response());
    }

    Ok(Json(InterstitialResponse {
        short_code: resolution.url.short_code,
        original_url: resolution.url.original_url,
        confirm_required: true,
    })
    .into_response())
}

/// Lists a user's URLs, newest first
///
/// # Query Parameters
///
/// - `user_id` (required) - Creator of the links
/// - `page` (optional) - Page number, starts from 1 (default: 1)
/// - `limit` (optional) - Items per page, max 100 (default: 10)
///
/// # Example Request
///
/// `GET /api/urls?user_id=7&page=2&limit=20`
///
/// # Response
///
/// ```json
/// {
///   "page": 2,
///   "limit": 20,
///   "total_fetched": 15,
///   "data": [...]
/// }
/// ```
pub async fn list_urls(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, AppError> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(10).clamp(1, 100);

    let results = shortening::list_urls(&state.db, params.user_id, page, limit)?;

    Ok(Json(json!({
        "page": page,
        "limit": limit,
        "total_fetched": results.len(),
        "data": results
    })))
}

/// Deletes a short URL on behalf of its creator
///
/// # Example Request
///
/// `DELETE /api/urls/abc123?user_id=7`
///
/// # Response
///
/// - **200 OK** - URL deleted
/// - **403 Forbidden** - `user_id` is not the creator
/// - **404 Not Found** - URL does not exist
pub async fn delete_short_url(
    Path(code): Path<String>,
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>, AppError> {
    shortening::delete_url(&state.db, &code, params.user_id)?;

    Ok(Json(json!({
        "message": "Short link deleted successfully",
        "deleted_id": code
    })))
}

/// Registers a user
///
/// Opens the wallet, grants the signup bonus and queues the welcome email.
/// Registering an existing username returns that user unchanged.
///
/// # Response
///
/// - **201 Created** - New user
/// - **200 OK** - Username already registered
pub async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Response, AppError> {
    let registration = accounts::register_user(&state.db, &payload, state.config.signup_bonus)?;
    let balance = ledger::get_wallet(&state.db, registration.user.id)?
        .map(|wallet| wallet.balance)
        .unwrap_or_default();

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let response = RegisterResponse {
        user: registration.user,
        balance,
        created: registration.created,
    };
    Ok((status, Json(response)).into_response())
}

/// Balance and transaction history of a wallet, newest first
pub async fn get_wallet(
    Path(user_id): Path<UserId>,
    State(state): State<AppState>,
) -> Result<Json<WalletResponse>, AppError> {
    let wallet = ledger::get_wallet(&state.db, user_id)?
        .ok_or(LedgerError::WalletNotFound(user_id))?;
    let transactions = ledger::history(&state.db, user_id)?;

    Ok(Json(WalletResponse {
        user_id,
        balance: wallet.balance,
        transactions,
    }))
}

/// Refunds a completed transaction
///
/// # Response
///
/// - **200 OK** - The compensating transaction
/// - **402 Payment Required** - Refunding a credit that has already been spent
/// - **409 Conflict** - The transaction is not SUCCESS
pub async fn refund_transaction(
    Path(transaction_id): Path<TransactionId>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let refund = atomic(&state.db, |txn| ledger::refund(txn, transaction_id))?;
    Ok(Json(refund).into_response())
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(payload): Json<NewPlan>,
) -> Result<Response, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("plan name must not be empty".to_string()));
    }
    let plan = atomic(&state.db, |txn| subscription::create_plan(txn, &payload))?;
    Ok((StatusCode::CREATED, Json(plan)).into_response())
}

pub async fn cancel_subscription(
    Path(subscription_id): Path<SubscriptionId>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let subscription = atomic(&state.db, |txn| subscription::cancel(txn, subscription_id))?;
    Ok(Json(subscription).into_response())
}

/// Starts a Mercado Pago checkout for a coin package or a plan
///
/// # Request Body
///
/// ```json
/// { "user_id": 7, "type": "credits", "amount": 50 }
/// { "user_id": 7, "type": "plan", "plan_id": 2 }
/// ```
///
/// # Response
///
/// - **200 OK** - `{"preference_id": "...", "init_point": "https://..."}`
/// - **400 Bad Request** - No package holds that many coins
/// - **404 Not Found** - Unknown user or plan
pub async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    if accounts::get_user(&state.db, payload.user_id)?.is_none() {
        return Err(AppError::NotFound(format!("user {} not found", payload.user_id)));
    }

    let mut metadata = Map::new();
    metadata.insert("user_id".to_string(), Value::String(payload.user_id.to_string()));

    let (title, price_cents) = match payload.item {
        CheckoutItem::Credits { amount } => {
            let price = pricing::package_price(amount).ok_or_else(|| {
                AppError::BadRequest(format!("no package with {amount} coins"))
            })?;
            metadata.insert("type".to_string(), Value::String("credits".to_string()));
            metadata.insert("amount".to_string(), Value::String(amount.to_string()));
            (format!("{amount} coins"), price)
        }
        CheckoutItem::Plan { plan_id } => {
            let plan = subscription::get_plan(&state.db, plan_id)?
                .ok_or(SubscriptionError::PlanNotFound(plan_id))?;
            metadata.insert("type".to_string(), Value::String("plan".to_string()));
            metadata.insert("plan_id".to_string(), Value::String(plan_id.to_string()));
            (format!("Plan {}", plan.name), plan.price_cents)
        }
    };

    let base = &state.config.base_url;
    let preference = CheckoutPreference {
        items: vec![PreferenceItem {
            title,
            quantity: 1,
            currency_id: "BRL".to_string(),
            unit_price: price_cents as f64 / 100.0,
        }],
        back_urls: BackUrls {
            success: format!("{base}/billing/success"),
            failure: format!("{base}/billing/failure"),
            pending: format!("{base}/billing/pending"),
        },
        auto_return: "approved".to_string(),
        metadata,
        notification_url: state.config.notification_url(),
    };

    let created = state.provider.create_preference(&preference).await?;
    info!(user_id = %payload.user_id, preference_id = %created.id, "checkout started");

    Ok(Json(CheckoutResponse {
        preference_id: created.id,
        init_point: created.init_point,
    }))
}

/// Mercado Pago notification endpoint
///
/// Accepts JSON or form-encoded bodies; `topic`, `id` and `data.id` may also
/// arrive in the query string. Signature failures answer `ignored` with 200.
///
/// # Response
///
/// `{"status": "ignored" | "waiting_payment" | "pending" | "already_processed"
/// | "queued" | "subscription_activated"}`, with **202 Accepted** for `queued`.
pub async fn mercadopago_webhook(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let event = WebhookEvent::from_parts(
        &query,
        &parse_body(&body),
        header(&headers, "x-signature"),
        header(&headers, "x-request-id"),
    );

    let outcome = reconcile::handle(&state, &event).await?;
    Ok((outcome.status_code(), Json(json!({ "status": outcome }))).into_response())
}

/// Client address from `X-Forwarded-For` (first hop) or `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> String {
    header(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| header(headers, "x-real-ip"))
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// JSON first, then form encoding; anything else is an empty object.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Object(Map::new());
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        Ok(pairs) => Value::Object(
            pairs
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ),
        Err(_) => Value::Object(Map::new()),
    }
}
