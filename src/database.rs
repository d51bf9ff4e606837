//! Database initialization and table definitions
//!
//! This module handles the setup of the embedded redb database. Records are
//! stored as JSON strings keyed by zero-padded ids (so that key order is id
//! order) or by composite index keys queried with range scans.
//!
//! redb admits a single write transaction at a time. Every balance mutation
//! runs inside one, which gives each wallet at most one in-flight mutator.

use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, TableDefinition,
    WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::Config;
use crate::error::StoreError;
use crate::jobs::JobQueue;
use crate::provider::PaymentProvider;
use crate::shortcode::ShortCodeCodec;

/// Named monotonic counters (url sequence, record ids).
///
/// Key: counter name, Value: last issued value
pub const TABLE_SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences_v1");

/// Key: user id, Value: JSON `User`
pub const TABLE_USERS: TableDefinition<&str, &str> = TableDefinition::new("users_v1");

/// Key: username, Value: user id
pub const TABLE_USERNAMES: TableDefinition<&str, &str> = TableDefinition::new("usernames_v1");

/// Key: user id, Value: JSON `Wallet`
pub const TABLE_WALLETS: TableDefinition<&str, &str> = TableDefinition::new("wallets_v1");

/// Key: transaction id, Value: JSON `WalletTransaction`
pub const TABLE_TRANSACTIONS: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_transactions_v1");

/// Unique index on `external_reference`.
///
/// Key: external reference, Value: transaction id
pub const TABLE_TX_REFERENCES: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_tx_references_v1");

/// Key: "{user_id}:{transaction_id}", Value: transaction id
pub const TABLE_WALLET_HISTORY: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_history_v1");

/// Main table for storing url records
///
/// Key: short code, Value: JSON `UrlRecord`
pub const TABLE_URLS: TableDefinition<&str, &str> = TableDefinition::new("urls_v1");

/// Lookup of earlier links by submitter, flags and target.
///
/// Key: "{owner}\x1f{flags}\x1f{original_url}\x1f{url_id}", Value: short code
pub const TABLE_URL_LOOKUP: TableDefinition<&str, &str> = TableDefinition::new("url_lookup_v1");

/// Anonymous links by client address, for the daily quota.
///
/// Key: "{ip}\x1f{created_at_micros}\x1f{url_id}", Value: short code
pub const TABLE_ANONYMOUS_LINKS: TableDefinition<&str, &str> =
    TableDefinition::new("anonymous_links_v1");

/// Links of one authenticated user, oldest first.
///
/// Key: "{user_id}:{url_id}", Value: short code
pub const TABLE_USER_URLS: TableDefinition<&str, &str> = TableDefinition::new("user_urls_v1");

/// Key: "{url_id}:{event_id}", Value: JSON `AccessEvent`
pub const TABLE_ACCESS_EVENTS: TableDefinition<&str, &str> =
    TableDefinition::new("access_events_v1");

/// Key: plan id, Value: JSON `Plan`
pub const TABLE_PLANS: TableDefinition<&str, &str> = TableDefinition::new("plans_v1");

/// Key: plan name, Value: plan id
pub const TABLE_PLAN_NAMES: TableDefinition<&str, &str> = TableDefinition::new("plan_names_v1");

/// Key: subscription id, Value: JSON `UserSubscription`
pub const TABLE_SUBSCRIPTIONS: TableDefinition<&str, &str> =
    TableDefinition::new("subscriptions_v1");

/// One subscription per (user, plan).
///
/// Key: "{user_id}:{plan_id}", Value: subscription id
pub const TABLE_USER_PLANS: TableDefinition<&str, &str> = TableDefinition::new("user_plans_v1");

/// Key: provider payment id, Value: subscription id
pub const TABLE_SUBSCRIPTION_REFERENCES: TableDefinition<&str, &str> =
    TableDefinition::new("subscription_references_v1");

/// Key: job id, Value: JSON `CreditJob`
pub const TABLE_JOBS: TableDefinition<&str, &str> = TableDefinition::new("credit_jobs_v1");

/// Key: provider payment id, Value: job id
pub const TABLE_JOB_PAYMENTS: TableDefinition<&str, &str> = TableDefinition::new("job_payments_v1");

/// Key: message id, Value: JSON `OutboxMessage`
pub const TABLE_OUTBOX: TableDefinition<&str, &str> = TableDefinition::new("outbox_v1");

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
    pub codec: Arc<ShortCodeCodec>,
    pub provider: Arc<dyn PaymentProvider>,
    pub jobs: JobQueue,
}

/// Initializes the embedded database and creates every table
///
/// # Example
///
/// ```no_run
/// # use linkledger::database::init_db;
/// let db = init_db("data.db").expect("Failed to initialize database");
/// ```
pub fn init_db(db_path: &str) -> Result<Database, redb::Error> {
    let db = Database::create(db_path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(TABLE_SEQUENCES)?;
        for table in [
            TABLE_USERS,
            TABLE_USERNAMES,
            TABLE_WALLETS,
            TABLE_TRANSACTIONS,
            TABLE_TX_REFERENCES,
            TABLE_WALLET_HISTORY,
            TABLE_URLS,
            TABLE_URL_LOOKUP,
            TABLE_ANONYMOUS_LINKS,
            TABLE_USER_URLS,
            TABLE_ACCESS_EVENTS,
            TABLE_PLANS,
            TABLE_PLAN_NAMES,
            TABLE_SUBSCRIPTIONS,
            TABLE_USER_PLANS,
            TABLE_SUBSCRIPTION_REFERENCES,
            TABLE_JOBS,
            TABLE_JOB_PAYMENTS,
            TABLE_OUTBOX,
        ] {
            write_txn.open_table(table)?;
        }
    }
    write_txn.commit()?;

    Ok(db)
}

/// Zero-padded key so that lexicographic order matches numeric order.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// Parses a key produced by [`id_key`].
pub fn parse_id(key: &str) -> Option<u64> {
    key.parse().ok()
}

/// Reads and decodes one JSON record.
pub fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

/// Encodes and writes one JSON record, replacing any previous value.
pub fn store<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static str>,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(record)?;
    table.insert(key, json.as_str())?;
    Ok(())
}

/// Collects every entry whose key starts with `prefix`.
///
/// Index keys only ever carry digits after their prefix, so `~` bounds the range.
pub fn scan_prefix(
    table: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> Result<Vec<(String, String)>, StoreError> {
    let end = format!("{prefix}~");
    let mut entries = Vec::new();
    for entry in table.range(prefix..end.as_str())? {
        let (key, value) = entry?;
        entries.push((key.value().to_string(), value.value().to_string()));
    }
    Ok(entries)
}

/// Decodes every record of a table, in key order.
pub fn load_all<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        records.push(serde_json::from_str(value.value())?);
    }
    Ok(records)
}

/// Increments a named counter and returns the new value (first value is 1).
pub fn next_value(txn: &WriteTransaction, counter: &str) -> Result<u64, StoreError> {
    let mut table = txn.open_table(TABLE_SEQUENCES)?;
    let current = table.get(counter)?.map(|guard| guard.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(counter, next)?;
    Ok(next)
}

/// Runs `f` inside one write transaction: committed on `Ok`, aborted on `Err`.
pub fn atomic<T, E, F>(db: &Database, f: F) -> Result<T, E>
where
    F: FnOnce(&WriteTransaction) -> Result<T, E>,
    E: From<StoreError>,
{
    let txn = db.begin_write().map_err(StoreError::from)?;
    match f(&txn) {
        Ok(value) => {
            txn.commit().map_err(StoreError::from)?;
            Ok(value)
        }
        Err(err) => {
            txn.abort().map_err(StoreError::from)?;
            Err(err)
        }
    }
}

/// Runs `f` against a consistent read snapshot.
pub fn snapshot<T, E, F>(db: &Database, f: F) -> Result<T, E>
where
    F: FnOnce(&ReadTransaction) -> Result<T, E>,
    E: From<StoreError>,
{
    let txn = db.begin_read().map_err(StoreError::from)?;
    f(&txn)
}

#[cfg(test)]
pub(crate) fn temp_db() -> (Database, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    let db = init_db(file.path().to_str().unwrap()).expect("Failed to initialize test database");
    (db, file)
}
