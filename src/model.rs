//! Data models for the link shortener and its wallet ledger
//!
//! Persisted records are stored as JSON in redb tables (see
//! [`crate::database`]). Request/response bodies of the HTTP API live at the
//! bottom of this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identifier.
pub type UserId = u64;

/// Wallet transaction identifier.
pub type TransactionId = u64;

/// Short url row identifier, the value drawn from the url sequence.
pub type UrlId = u64;

pub type PlanId = u64;

pub type SubscriptionId = u64;

/// Credit job identifier.
pub type JobId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// One wallet per user. `balance` is counted in whole coins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: u64,
    /// Bumped on every balance mutation
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Direction of a ledger entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
}

impl TransactionKind {
    /// The kind that undoes this one.
    pub fn reverse(self) -> Self {
        match self {
            TransactionKind::Credit => TransactionKind::Debit,
            TransactionKind::Debit => TransactionKind::Credit,
        }
    }
}

/// Lifecycle of a ledger entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Refunded,
}

impl TransactionStatus {
    /// Every legal move of the ledger state machine.
    pub const TRANSITIONS: [(TransactionStatus, TransactionStatus); 3] = [
        (TransactionStatus::Pending, TransactionStatus::Success),
        (TransactionStatus::Pending, TransactionStatus::Failed),
        (TransactionStatus::Success, TransactionStatus::Refunded),
    ];

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    /// Entering these states stamps `processed_at`.
    pub fn is_processed(self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Refunded)
    }
}

/// An append-mostly ledger entry.
///
/// Only `status` and `processed_at` ever change after creation, and only
/// through [`WalletTransaction::transition`](crate::ledger).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    pub id: TransactionId,
    /// Owner of the wallet this entry belongs to
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: u64,
    pub source: String,
    /// Idempotency key for provider-originated entries, unique across the ledger
    pub external_reference: Option<String>,
    /// Set on the compensating entry created by a refund
    #[serde(default)]
    pub refund_of: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Flags that drive both the price of a link and its redirect behaviour.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrlMetadata {
    /// Skip the confirmation interstitial
    pub is_direct: bool,
    /// Exempt from the expiry sweep
    pub is_permanent: bool,
}

impl UrlMetadata {
    /// Compact form used inside index keys.
    pub fn flags(&self) -> String {
        format!("d{}p{}", u8::from(self.is_direct), u8::from(self.is_permanent))
    }
}

/// Represents a short url stored in the database
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub id: UrlId,

    /// Encoded form of `id`, globally unique and never reassigned
    pub short_code: String,

    pub original_url: String,

    /// The complete shortened url (e.g. "http://localhost:8080/aB3xYz")
    pub short_url: String,

    /// Authenticated creator, `None` for anonymous links
    pub created_by: Option<UserId>,

    /// Client address of the creator
    pub created_by_ip: Option<String>,

    pub created_at: DateTime<Utc>,

    /// `None` for permanent links
    pub expires_at: Option<DateTime<Utc>>,

    pub metadata: UrlMetadata,

    #[serde(default)]
    pub clicks: u64,
}

impl UrlRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.metadata.is_permanent && self.expires_at.is_some_and(|at| now > at)
    }
}

/// One redirect click.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub id: u64,
    pub url_id: UrlId,
    pub short_code: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub monthly_credits: u64,
    /// Price in BRL cents
    pub price_cents: u64,
    pub disable_interstitial_page: bool,
    pub advanced_stats: bool,
    pub longtime_expiration_date: bool,
    pub conditional_redirect: bool,
    pub priority_support: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Canceled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserSubscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    /// Provider payment that last activated this subscription
    #[serde(default)]
    pub external_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Completed,
    /// The payment had already been applied when the job ran
    Skipped,
    /// Retries exhausted or a validation failure; needs an operator
    Failed,
}

/// Durable record of an offloaded wallet credit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreditJob {
    pub id: JobId,
    pub payment_id: String,
    pub user_id: UserId,
    pub amount: u64,
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outgoing email waiting for the mailer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: u64,
    pub user_id: UserId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Whether `shorten` minted a new link or returned an identical earlier one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShortenResult {
    Created,
    Exists,
}

/// Request payload for creating a new short url
///
/// # Example
/// ```json
/// {
///   "url": "https://example.com/very/long/url",
///   "user_id": 7,
///   "is_direct": true
/// }
/// ```
#[derive(Deserialize, Debug, Clone)]
pub struct ShortenRequest {
    pub url: String,

    /// Authenticated creator; anonymous when absent
    pub user_id: Option<UserId>,

    #[serde(default)]
    pub is_direct: bool,

    #[serde(default)]
    pub is_permanent: bool,

    /// Mint a fresh link even if an identical one exists
    #[serde(default)]
    pub create_new: bool,
}

#[derive(Serialize, Debug)]
pub struct ShortenResponse {
    pub short_code: String,
    pub short_url: String,
    pub original_url: String,
    pub result: ShortenResult,
    /// Coins debited for this request
    pub charged: u64,
    pub is_direct: bool,
    pub is_permanent: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Query parameters for listing a user's links
///
/// Example: `GET /api/urls?user_id=7&page=2&limit=20`
#[derive(Deserialize, Debug, Clone)]
pub struct ListParams {
    pub user_id: UserId,

    /// Page number, starts from 1 (default: 1)
    pub page: Option<usize>,

    /// Items per page, max 100 (default: 10)
    pub limit: Option<usize>,
}

/// Query parameters for deleting a link
#[derive(Deserialize, Debug, Clone)]
pub struct DeleteParams {
    /// Must match the creator of the link
    pub user_id: UserId,
}

/// Body served instead of a redirect when the link needs confirmation.
#[derive(Serialize, Debug)]
pub struct InterstitialResponse {
    pub short_code: String,
    pub original_url: String,
    pub confirm_required: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
}

#[derive(Serialize, Debug)]
pub struct RegisterResponse {
    pub user: User,
    pub balance: u64,
    pub created: bool,
}

#[derive(Serialize, Debug)]
pub struct WalletResponse {
    pub user_id: UserId,
    pub balance: u64,
    pub transactions: Vec<WalletTransaction>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub monthly_credits: u64,
    #[serde(default)]
    pub price_cents: u64,
    #[serde(default = "default_true")]
    pub disable_interstitial_page: bool,
    #[serde(default)]
    pub advanced_stats: bool,
    #[serde(default)]
    pub longtime_expiration_date: bool,
    #[serde(default)]
    pub conditional_redirect: bool,
    #[serde(default)]
    pub priority_support: bool,
}

fn default_true() -> bool {
    true
}

/// What the payer is buying.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckoutItem {
    Credits { amount: u64 },
    Plan { plan_id: PlanId },
}

#[derive(Deserialize, Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: UserId,
    #[serde(flatten)]
    pub item: CheckoutItem,
}

#[derive(Serialize, Debug)]
pub struct CheckoutResponse {
    pub preference_id: String,
    pub init_point: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transition_table_allows_only_documented_moves() {
        use TransactionStatus::*;
        let all = [Pending, Success, Failed, Refunded];
        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Pending, Success) | (Pending, Failed) | (Success, Refunded)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn reverse_kind() {
        assert_eq!(TransactionKind::Credit.reverse(), TransactionKind::Debit);
        assert_eq!(TransactionKind::Debit.reverse(), TransactionKind::Credit);
    }

    #[test]
    fn permanent_links_never_expire() {
        let now = Utc::now();
        let mut record = UrlRecord {
            id: 1,
            short_code: "abcdef".to_string(),
            original_url: "https://example.com".to_string(),
            short_url: "http://localhost:8080/abcdef".to_string(),
            created_by: None,
            created_by_ip: Some("127.0.0.1".to_string()),
            created_at: now - Duration::days(10),
            expires_at: Some(now - Duration::days(3)),
            metadata: UrlMetadata::default(),
            clicks: 0,
        };
        assert!(record.is_expired(now));

        record.metadata.is_permanent = true;
        assert!(!record.is_expired(now));
    }

    #[test]
    fn checkout_item_is_tagged_by_type() {
        let request: CheckoutRequest =
            serde_json::from_str(r#"{"user_id": 7, "type": "credits", "amount": 50}"#).unwrap();
        assert_eq!(request.item, CheckoutItem::Credits { amount: 50 });

        let request: CheckoutRequest =
            serde_json::from_str(r#"{"user_id": 7, "type": "plan", "plan_id": 2}"#).unwrap();
        assert_eq!(request.item, CheckoutItem::Plan { plan_id: 2 });
    }
}
