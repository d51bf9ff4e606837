//! Error taxonomy for the ledger, the shortener and the payment webhook
//!
//! Every concern owns a `thiserror` enum. Storage failures from redb are
//! funnelled through [`StoreError`] so that `?` works on redb calls inside any
//! service function. [`AppError`] is the HTTP-facing wrapper.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::model::{JobId, PlanId, SubscriptionId, TransactionId, UserId};

/// Failure of the embedded database or of a stored record's encoding.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Lets `?` lift every redb error type into an enum that wraps [`StoreError`].
macro_rules! from_redb {
    ($($target:ty),+ $(,)?) => {
        $(
            impl From<redb::DatabaseError> for $target {
                fn from(err: redb::DatabaseError) -> Self {
                    StoreError::Database(err.into()).into()
                }
            }
            impl From<redb::TransactionError> for $target {
                fn from(err: redb::TransactionError) -> Self {
                    StoreError::Database(err.into()).into()
                }
            }
            impl From<redb::TableError> for $target {
                fn from(err: redb::TableError) -> Self {
                    StoreError::Database(err.into()).into()
                }
            }
            impl From<redb::StorageError> for $target {
                fn from(err: redb::StorageError) -> Self {
                    StoreError::Database(err.into()).into()
                }
            }
            impl From<redb::CommitError> for $target {
                fn from(err: redb::CommitError) -> Self {
                    StoreError::Database(err.into()).into()
                }
            }
        )+
    };
}

from_redb!(
    StoreError,
    LedgerError,
    ShortenError,
    SubscriptionError,
    JobError,
    AccountError,
);

/// Ledger validation failures. None of these are retried automatically.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid credit amount")]
    InvalidCreditAmount,

    #[error("invalid debit amount")]
    InvalidDebitAmount,

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    #[error("balance overflow for user {0}")]
    BalanceOverflow(UserId),

    #[error("transaction {0} already processed")]
    AlreadyProcessed(TransactionId),

    #[error("only completed transactions can be refunded (transaction {0})")]
    NotRefundable(TransactionId),

    #[error("external reference {0} already recorded")]
    DuplicateReference(String),

    #[error("wallet for user {0} not found")]
    WalletNotFound(UserId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ShortCodeError {
    #[error("short codes encode non-negative integers only")]
    InvalidNumber,
}

#[derive(Debug, Error)]
pub enum ShortenError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("short url {0} not found")]
    NotFound(String),

    #[error("short url {0} has expired")]
    Expired(String),

    #[error("short code {0} is already taken")]
    CodeTaken(String),

    #[error("you are not allowed to change short url {0}")]
    NotOwner(String),

    #[error(transparent)]
    ShortCode(#[from] ShortCodeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("plan name {0} already exists")]
    DuplicatePlanName(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rejected webhook signature. Never surfaced to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature header malformed")]
    Malformed,

    #[error("webhook secret not configured")]
    NotConfigured,

    #[error("signature mismatch")]
    Mismatch,
}

/// Failure talking to the payment provider. Transient by nature.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider api error status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("merchant_order_id_missing")]
    MissingMerchantOrderId,

    #[error("id_missing")]
    MissingPaymentId,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("job queue closed")]
    QueueClosed,

    #[error("worker crashed: {0}")]
    Worker(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Validation failures are final; storage hiccups and missing users may heal.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::UserNotFound(_) | JobError::Store(_) | JobError::Worker(_) => true,
            JobError::Ledger(LedgerError::Store(_)) => true,
            JobError::Ledger(_) | JobError::NotFound(_) | JobError::QueueClosed => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("username must not be empty")]
    InvalidUsername,

    #[error("invalid email address")]
    InvalidEmail,

    #[error("mail delivery failed: {0}")]
    Mail(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Error returned by HTTP handlers, rendered as `{"error": ..., "code": ...}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Shorten(#[from] ShortenError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    TooManyRequests(String),
}

impl LedgerError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            LedgerError::InvalidCreditAmount | LedgerError::InvalidDebitAmount => {
                (StatusCode::BAD_REQUEST, "invalid_amount")
            }
            LedgerError::InsufficientBalance { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_balance")
            }
            LedgerError::BalanceOverflow(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "balance_overflow")
            }
            LedgerError::AlreadyProcessed(_) | LedgerError::DuplicateReference(_) => {
                (StatusCode::CONFLICT, "already_processed")
            }
            LedgerError::NotRefundable(_) => (StatusCode::CONFLICT, "not_refundable"),
            LedgerError::WalletNotFound(_) | LedgerError::TransactionNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            LedgerError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        }
    }
}

impl SubscriptionError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            SubscriptionError::PlanNotFound(_)
            | SubscriptionError::SubscriptionNotFound(_)
            | SubscriptionError::UserNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SubscriptionError::DuplicatePlanName(_) => (StatusCode::CONFLICT, "duplicate_plan"),
            SubscriptionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        }
    }
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Ledger(err) => err.status(),
            AppError::Shorten(err) => match err {
                ShortenError::InvalidUrl(_) | ShortenError::ShortCode(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_url")
                }
                ShortenError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ShortenError::Expired(_) => (StatusCode::GONE, "expired"),
                ShortenError::CodeTaken(_) => (StatusCode::CONFLICT, "code_taken"),
                ShortenError::NotOwner(_) => (StatusCode::FORBIDDEN, "forbidden"),
                ShortenError::Ledger(inner) => inner.status(),
                ShortenError::Subscription(inner) => inner.status(),
                ShortenError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
            AppError::Subscription(err) => err.status(),
            AppError::Webhook(err) => match err {
                WebhookError::MissingMerchantOrderId | WebhookError::MissingPaymentId => {
                    (StatusCode::BAD_REQUEST, "invalid_event")
                }
                WebhookError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
                WebhookError::Subscription(inner) => inner.status(),
                WebhookError::Job(_) | WebhookError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            AppError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            AppError::Account(err) => match err {
                AccountError::InvalidUsername | AccountError::InvalidEmail => {
                    (StatusCode::BAD_REQUEST, "invalid_account")
                }
                AccountError::Ledger(inner) => inner.status(),
                AccountError::Mail(_) | AccountError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        (
            status,
            Json(json!({
                "error": self.to_string(),
                "code": code,
            })),
        )
            .into_response()
    }
}
