//! Link creation, redirect resolution and the expiry sweep
//!
//! `shorten` charges the creator and mints the link in one write transaction,
//! so a debit never commits without its link and the other way round.
//! Repeat submissions of the same target with the same flags by the same
//! submitter return the earlier link without charging again.

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, WriteTransaction};
use tracing::{debug, info};

use crate::config::Config;
use crate::database::{
    self, atomic, id_key, load, load_all, scan_prefix, snapshot, store, TABLE_ACCESS_EVENTS,
    TABLE_ANONYMOUS_LINKS, TABLE_URLS, TABLE_URL_LOOKUP, TABLE_USER_URLS,
};
use crate::error::{ShortenError, StoreError};
use crate::ledger;
use crate::model::{AccessEvent, ShortenResult, UrlId, UrlMetadata, UrlRecord, UserId};
use crate::pricing;
use crate::shortcode::{ShortCodeCodec, URL_SEQUENCE};
use crate::subscription;

const ACCESS_EVENT_COUNTER: &str = "access_events";
const MAX_URL_LENGTH: usize = 4096;
const SEP: char = '\x1f';

/// One request to shorten a url.
#[derive(Debug, Clone)]
pub struct ShortenCommand<'a> {
    /// Authenticated creator; `None` for anonymous submissions
    pub user_id: Option<UserId>,
    pub client_ip: &'a str,
    pub original_url: &'a str,
    pub metadata: UrlMetadata,
    /// Mint a new link even when an identical one exists
    pub create_new: bool,
}

#[derive(Debug, Clone)]
pub struct Shortened {
    pub url: UrlRecord,
    pub result: ShortenResult,
    /// Coins debited by this call
    pub charged: u64,
}

/// A link that is about to be followed.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub url: UrlRecord,
    /// Skip the confirmation page
    pub direct: bool,
}

/// Shortens a url, charging authenticated users [`pricing::cost`] coins.
///
/// Anonymous submissions are free; their daily quota is enforced by the caller.
pub fn shorten(
    db: &Database,
    codec: &ShortCodeCodec,
    config: &Config,
    command: &ShortenCommand<'_>,
) -> Result<Shortened, ShortenError> {
    let original_url = validate_url(command.original_url)?;
    let metadata = command.metadata;
    let cost = pricing::cost(metadata.is_direct, metadata.is_permanent);
    let owner = owner_key(command.user_id, command.client_ip);

    atomic(db, |txn| {
        let now = Utc::now();

        if let Some(existing) = find_existing(txn, &owner, &metadata, original_url, now)? {
            if !command.create_new {
                debug!(short_code = %existing.short_code, "returning existing short url");
                return Ok(Shortened {
                    url: existing,
                    result: ShortenResult::Exists,
                    charged: 0,
                });
            }
        }

        let charged = match command.user_id {
            Some(user_id) => {
                ledger::debit(txn, user_id, cost, "URL shortening", None)?;
                cost
            }
            None => 0,
        };

        let id = database::next_value(txn, URL_SEQUENCE)?;
        let short_code = codec.encode(id)?;

        let record = UrlRecord {
            id,
            short_code: short_code.clone(),
            original_url: original_url.to_string(),
            short_url: config.short_url(&short_code),
            created_by: command.user_id,
            created_by_ip: Some(command.client_ip.to_string()),
            created_at: now,
            expires_at: (!metadata.is_permanent).then(|| now + Duration::days(config.url_ttl_days)),
            metadata,
            clicks: 0,
        };

        {
            let mut urls = txn.open_table(TABLE_URLS)?;
            if urls.get(short_code.as_str())?.is_some() {
                return Err(ShortenError::CodeTaken(short_code));
            }
            store(&mut urls, &short_code, &record)?;
        }
        insert_index_entries(txn, &record)?;

        info!(
            short_code = %record.short_code,
            user_id = ?record.created_by,
            charged = charged,
            "short url created"
        );
        Ok(Shortened {
            url: record,
            result: ShortenResult::Created,
            charged,
        })
    })
}

/// Looks up a link for redirection and records the click.
///
/// Codes the codec did not produce are rejected without touching the database
/// for writing. Expired links fail with [`ShortenError::Expired`] and record nothing.
pub fn resolve(
    db: &Database,
    codec: &ShortCodeCodec,
    short_code: &str,
    client_ip: &str,
    now: DateTime<Utc>,
) -> Result<Resolution, ShortenError> {
    if codec.decode(short_code).is_none() {
        return Err(ShortenError::NotFound(short_code.to_string()));
    }

    let url = atomic(db, |txn| {
        let mut urls = txn.open_table(TABLE_URLS)?;
        let mut record: UrlRecord = load(&urls, short_code)?
            .ok_or_else(|| ShortenError::NotFound(short_code.to_string()))?;
        if record.is_expired(now) {
            return Err(ShortenError::Expired(short_code.to_string()));
        }

        record.clicks += 1;
        store(&mut urls, short_code, &record)?;
        drop(urls);

        let event = AccessEvent {
            id: database::next_value(txn, ACCESS_EVENT_COUNTER)?,
            url_id: record.id,
            short_code: record.short_code.clone(),
            ip_address: client_ip.to_string(),
            created_at: now,
        };
        let key = format!("{}:{}", id_key(record.id), id_key(event.id));
        store(&mut txn.open_table(TABLE_ACCESS_EVENTS)?, &key, &event)?;

        Ok::<_, ShortenError>(record)
    })?;

    let direct = url.metadata.is_direct
        || match url.created_by {
            Some(user_id) => subscription::interstitial_disabled(db, user_id)?,
            None => false,
        };

    debug!(short_code = %url.short_code, direct = direct, "short url resolved");
    Ok(Resolution { url, direct })
}

/// Click log of one link, oldest first.
pub fn access_events(db: &Database, url_id: UrlId) -> Result<Vec<AccessEvent>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_ACCESS_EVENTS)?;
        scan_prefix(&table, &format!("{}:", id_key(url_id)))?
            .into_iter()
            .map(|(_, json)| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    })
}

pub fn get_url(db: &Database, short_code: &str) -> Result<Option<UrlRecord>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_URLS)?;
        load(&table, short_code)
    })
}

/// Links created by `user_id`, newest first, one page at a time.
pub fn list_urls(
    db: &Database,
    user_id: UserId,
    page: usize,
    limit: usize,
) -> Result<Vec<UrlRecord>, StoreError> {
    let offset = page.saturating_sub(1).saturating_mul(limit);
    snapshot(db, |txn| {
        let index = txn.open_table(TABLE_USER_URLS)?;
        let urls = txn.open_table(TABLE_URLS)?;

        let mut records = Vec::new();
        for (_, short_code) in scan_prefix(&index, &format!("{}:", id_key(user_id)))?
            .into_iter()
            .rev()
            .skip(offset)
            .take(limit)
        {
            if let Some(record) = load(&urls, &short_code)? {
                records.push(record);
            }
        }
        Ok(records)
    })
}

/// Deletes a link on behalf of its creator.
pub fn delete_url(
    db: &Database,
    short_code: &str,
    user_id: UserId,
) -> Result<UrlRecord, ShortenError> {
    atomic(db, |txn| {
        let record: UrlRecord = {
            let urls = txn.open_table(TABLE_URLS)?;
            load(&urls, short_code)?.ok_or_else(|| ShortenError::NotFound(short_code.to_string()))?
        };
        if record.created_by != Some(user_id) {
            return Err(ShortenError::NotOwner(short_code.to_string()));
        }

        remove_url(txn, &record)?;
        info!(short_code = %short_code, user_id = %user_id, "short url deleted");
        Ok(record)
    })
}

/// Number of anonymous links created from `client_ip` since `since`.
pub fn anonymous_links_since(
    db: &Database,
    client_ip: &str,
    since: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let prefix = format!("{client_ip}{SEP}");
    let start = format!("{prefix}{:020}", since.timestamp_micros().max(0));
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_ANONYMOUS_LINKS)?;
        let count = scan_prefix(&table, &prefix)?
            .into_iter()
            .filter(|(key, _)| key.as_str() >= start.as_str())
            .count();
        Ok(count)
    })
}

/// Removes every expired non-permanent link with its index entries and clicks.
///
/// Returns how many links were deleted.
pub fn delete_expired_urls(db: &Database, now: DateTime<Utc>) -> Result<usize, StoreError> {
    atomic(db, |txn| {
        let expired: Vec<UrlRecord> = {
            let urls = txn.open_table(TABLE_URLS)?;
            load_all::<UrlRecord>(&urls)?
                .into_iter()
                .filter(|record| record.is_expired(now))
                .collect()
        };

        for record in &expired {
            remove_url(txn, record)?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired short urls deleted");
        }
        Ok(expired.len())
    })
}

fn validate_url(raw: &str) -> Result<&str, ShortenError> {
    let url = raw.trim();
    let invalid = || ShortenError::InvalidUrl(url.to_string());

    if url.is_empty() || url.len() > MAX_URL_LENGTH {
        return Err(invalid());
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(invalid)?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(url)
}

/// Identity used for deduplication: the user, or the client address when anonymous.
fn owner_key(user_id: Option<UserId>, client_ip: &str) -> String {
    match user_id {
        Some(id) => format!("u{}", id_key(id)),
        None => format!("ip:{client_ip}"),
    }
}

fn lookup_prefix(owner: &str, metadata: &UrlMetadata, original_url: &str) -> String {
    format!("{owner}{SEP}{}{SEP}{original_url}{SEP}", metadata.flags())
}

fn find_existing(
    txn: &WriteTransaction,
    owner: &str,
    metadata: &UrlMetadata,
    original_url: &str,
    now: DateTime<Utc>,
) -> Result<Option<UrlRecord>, StoreError> {
    let lookup = txn.open_table(TABLE_URL_LOOKUP)?;
    let urls = txn.open_table(TABLE_URLS)?;

    for (_, short_code) in scan_prefix(&lookup, &lookup_prefix(owner, metadata, original_url))? {
        if let Some(record) = load::<UrlRecord>(&urls, &short_code)? {
            if !record.is_expired(now) {
                return Ok(Some(record));
            }
        }
    }
    Ok(None)
}

fn index_keys(record: &UrlRecord) -> (String, Option<String>, Option<String>) {
    let ip = record.created_by_ip.as_deref().unwrap_or_default();
    let lookup = format!(
        "{}{}",
        lookup_prefix(&owner_key(record.created_by, ip), &record.metadata, &record.original_url),
        id_key(record.id)
    );
    let anonymous = record.created_by.is_none().then(|| {
        format!(
            "{ip}{SEP}{:020}{SEP}{}",
            record.created_at.timestamp_micros().max(0),
            id_key(record.id)
        )
    });
    let user = record
        .created_by
        .map(|user_id| format!("{}:{}", id_key(user_id), id_key(record.id)));
    (lookup, anonymous, user)
}

fn insert_index_entries(txn: &WriteTransaction, record: &UrlRecord) -> Result<(), StoreError> {
    let code = record.short_code.as_str();
    let (lookup, anonymous, user) = index_keys(record);

    txn.open_table(TABLE_URL_LOOKUP)?.insert(lookup.as_str(), code)?;
    if let Some(key) = anonymous {
        txn.open_table(TABLE_ANONYMOUS_LINKS)?.insert(key.as_str(), code)?;
    }
    if let Some(key) = user {
        txn.open_table(TABLE_USER_URLS)?.insert(key.as_str(), code)?;
    }
    Ok(())
}

fn remove_url(txn: &WriteTransaction, record: &UrlRecord) -> Result<(), StoreError> {
    let (lookup, anonymous, user) = index_keys(record);

    txn.open_table(TABLE_URLS)?.remove(record.short_code.as_str())?;
    txn.open_table(TABLE_URL_LOOKUP)?.remove(lookup.as_str())?;
    if let Some(key) = anonymous {
        txn.open_table(TABLE_ANONYMOUS_LINKS)?.remove(key.as_str())?;
    }
    if let Some(key) = user {
        txn.open_table(TABLE_USER_URLS)?.remove(key.as_str())?;
    }

    let mut events = txn.open_table(TABLE_ACCESS_EVENTS)?;
    for (key, _) in scan_prefix(&events, &format!("{}:", id_key(record.id)))? {
        events.remove(key.as_str())?;
    }
    Ok(())
}
