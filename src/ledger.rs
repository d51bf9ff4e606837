//! Wallet ledger.
//!
//! Each user has one wallet holding a non-negative coin balance, plus an
//! append-mostly log of [`WalletTransaction`]s. Entries move through the
//! state machine defined by [`TransactionStatus::TRANSITIONS`]:
//!
//! ```text
//! PENDING -> SUCCESS -> REFUNDED
//!         -> FAILED
//! ```
//!
//! The balance effect of an entry is applied exactly once, when it enters
//! SUCCESS. A refund never edits the amount of the original. It writes a new
//! opposite-direction SUCCESS entry and flips the original to REFUNDED.
//!
//! Every operation takes the caller's write transaction, so the balance change
//! and the ledger entry commit (or roll back) together with whatever else the
//! caller does.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, WriteTransaction};
use tracing::info;

use crate::database::{
    self, id_key, load, scan_prefix, snapshot, store, TABLE_TRANSACTIONS,
    TABLE_TX_REFERENCES, TABLE_WALLETS, TABLE_WALLET_HISTORY,
};
use crate::error::{LedgerError, StoreError};
use crate::model::{
    TransactionId, TransactionKind, TransactionStatus, UserId, Wallet, WalletTransaction,
};

const TRANSACTION_COUNTER: &str = "wallet_transactions";

impl WalletTransaction {
    /// Moves the entry to `next` if the transition table allows it.
    ///
    /// Entries that are no longer PENDING can never be financially
    /// reprocessed, so any illegal move reports [`LedgerError::AlreadyProcessed`].
    pub fn transition(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::AlreadyProcessed(self.id));
        }
        self.status = next;
        if next.is_processed() {
            self.processed_at = Some(now);
        }
        Ok(())
    }
}

/// Returns the user's wallet, creating an empty one if needed.
///
/// The flag is `true` when the wallet was created by this call.
pub fn open_wallet(txn: &WriteTransaction, user_id: UserId) -> Result<(Wallet, bool), LedgerError> {
    let mut table = txn.open_table(TABLE_WALLETS)?;
    let key = id_key(user_id);
    if let Some(wallet) = load::<Wallet>(&table, &key)? {
        return Ok((wallet, false));
    }

    let now = Utc::now();
    let wallet = Wallet {
        user_id,
        balance: 0,
        version: 0,
        created_at: now,
        updated_at: now,
    };
    store(&mut table, &key, &wallet)?;
    info!(user_id = %user_id, "wallet opened");
    Ok((wallet, true))
}

/// Credits `amount` coins and records a SUCCESS entry.
///
/// Does not deduplicate by itself: a reused `external_reference` fails with
/// [`LedgerError::DuplicateReference`] before the balance is touched.
pub fn credit(
    txn: &WriteTransaction,
    user_id: UserId,
    amount: u64,
    source: &str,
    external_reference: Option<&str>,
) -> Result<WalletTransaction, LedgerError> {
    let result = apply_entry(
        txn,
        user_id,
        TransactionKind::Credit,
        amount,
        source,
        external_reference,
    );
    log_result("credit", user_id, amount, &result);
    result
}

/// Debits `amount` coins and records a SUCCESS entry.
///
/// Fails with [`LedgerError::InsufficientBalance`] without any mutation when
/// the wallet holds less than `amount`.
pub fn debit(
    txn: &WriteTransaction,
    user_id: UserId,
    amount: u64,
    source: &str,
    external_reference: Option<&str>,
) -> Result<WalletTransaction, LedgerError> {
    let result = apply_entry(
        txn,
        user_id,
        TransactionKind::Debit,
        amount,
        source,
        external_reference,
    );
    log_result("debit", user_id, amount, &result);
    result
}

/// Reverses a SUCCESS entry.
///
/// Returns the new compensating entry; the original ends up REFUNDED.
pub fn refund(
    txn: &WriteTransaction,
    transaction_id: TransactionId,
) -> Result<WalletTransaction, LedgerError> {
    let mut original = load_transaction(txn, transaction_id)?;
    if original.status != TransactionStatus::Success {
        return Err(LedgerError::NotRefundable(transaction_id));
    }

    let now = Utc::now();
    let reverse = original.kind.reverse();
    let source = format!("Refund: {}", original.id);
    let mut compensation =
        new_entry(txn, original.user_id, reverse, original.amount, &source, None)?;
    compensation.refund_of = Some(original.id);

    mutate_wallet(txn, original.user_id, |wallet| {
        apply_balance(wallet, reverse, original.amount)
    })?;
    compensation.transition(TransactionStatus::Success, now)?;
    original.transition(TransactionStatus::Refunded, now)?;

    insert_entry(txn, &compensation)?;
    save_entry(txn, &original)?;

    info!(
        user_id = %original.user_id,
        transaction = %original.id,
        refund = %compensation.id,
        amount = %original.amount,
        "refund applied"
    );
    Ok(compensation)
}

/// Records a PENDING entry with no balance effect yet.
pub fn record_pending(
    txn: &WriteTransaction,
    user_id: UserId,
    kind: TransactionKind,
    amount: u64,
    source: &str,
    external_reference: Option<&str>,
) -> Result<WalletTransaction, LedgerError> {
    validate_amount(kind, amount)?;
    ensure_reference_free(txn, external_reference)?;
    wallet_in(txn, user_id)?;

    let entry = new_entry(txn, user_id, kind, amount, source, external_reference)?;
    insert_entry(txn, &entry)?;
    info!(user_id = %user_id, transaction = %entry.id, amount = %amount, "pending entry recorded");
    Ok(entry)
}

/// PENDING -> SUCCESS, applying the balance effect.
pub fn complete(
    txn: &WriteTransaction,
    transaction_id: TransactionId,
) -> Result<WalletTransaction, LedgerError> {
    let mut entry = load_transaction(txn, transaction_id)?;
    if !entry.status.can_transition_to(TransactionStatus::Success) {
        return Err(LedgerError::AlreadyProcessed(transaction_id));
    }

    mutate_wallet(txn, entry.user_id, |wallet| {
        apply_balance(wallet, entry.kind, entry.amount)
    })?;
    entry.transition(TransactionStatus::Success, Utc::now())?;
    save_entry(txn, &entry)?;

    info!(user_id = %entry.user_id, transaction = %entry.id, "pending entry completed");
    Ok(entry)
}

/// PENDING -> FAILED. The balance is left alone.
pub fn fail(
    txn: &WriteTransaction,
    transaction_id: TransactionId,
) -> Result<WalletTransaction, LedgerError> {
    let mut entry = load_transaction(txn, transaction_id)?;
    entry.transition(TransactionStatus::Failed, Utc::now())?;
    save_entry(txn, &entry)?;

    info!(user_id = %entry.user_id, transaction = %entry.id, "pending entry failed");
    Ok(entry)
}

pub fn get_wallet(db: &Database, user_id: UserId) -> Result<Option<Wallet>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_WALLETS)?;
        load(&table, &id_key(user_id))
    })
}

pub fn get_transaction(
    db: &Database,
    transaction_id: TransactionId,
) -> Result<Option<WalletTransaction>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_TRANSACTIONS)?;
        load(&table, &id_key(transaction_id))
    })
}

/// The user's ledger entries, newest first.
pub fn history(db: &Database, user_id: UserId) -> Result<Vec<WalletTransaction>, StoreError> {
    snapshot(db, |txn| {
        let index = txn.open_table(TABLE_WALLET_HISTORY)?;
        let entries = txn.open_table(TABLE_TRANSACTIONS)?;

        let mut transactions = Vec::new();
        for (_, transaction_key) in scan_prefix(&index, &format!("{}:", id_key(user_id)))? {
            if let Some(entry) = load::<WalletTransaction>(&entries, &transaction_key)? {
                transactions.push(entry);
            }
        }
        transactions.reverse();
        Ok(transactions)
    })
}

/// Whether a ledger entry already carries `reference`.
pub fn reference_recorded(db: &Database, reference: &str) -> Result<bool, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_TX_REFERENCES)?;
        let recorded = table.get(reference)?.is_some();
        Ok(recorded)
    })
}

/// Same as [`reference_recorded`], seen from inside a write transaction.
pub fn reference_recorded_in(txn: &WriteTransaction, reference: &str) -> Result<bool, StoreError> {
    let table = txn.open_table(TABLE_TX_REFERENCES)?;
    let recorded = table.get(reference)?.is_some();
    Ok(recorded)
}

fn apply_entry(
    txn: &WriteTransaction,
    user_id: UserId,
    kind: TransactionKind,
    amount: u64,
    source: &str,
    external_reference: Option<&str>,
) -> Result<WalletTransaction, LedgerError> {
    validate_amount(kind, amount)?;
    ensure_reference_free(txn, external_reference)?;

    let mut entry = new_entry(txn, user_id, kind, amount, source, external_reference)?;
    mutate_wallet(txn, user_id, |wallet| apply_balance(wallet, kind, amount))?;
    entry.transition(TransactionStatus::Success, Utc::now())?;
    insert_entry(txn, &entry)?;
    Ok(entry)
}

fn validate_amount(kind: TransactionKind, amount: u64) -> Result<(), LedgerError> {
    match (kind, amount) {
        (TransactionKind::Credit, 0) => Err(LedgerError::InvalidCreditAmount),
        (TransactionKind::Debit, 0) => Err(LedgerError::InvalidDebitAmount),
        _ => Ok(()),
    }
}

fn apply_balance(
    wallet: &mut Wallet,
    kind: TransactionKind,
    amount: u64,
) -> Result<(), LedgerError> {
    match kind {
        TransactionKind::Credit => {
            wallet.balance = wallet
                .balance
                .checked_add(amount)
                .ok_or(LedgerError::BalanceOverflow(wallet.user_id))?;
        }
        TransactionKind::Debit => {
            if wallet.balance < amount {
                return Err(LedgerError::InsufficientBalance {
                    available: wallet.balance,
                    requested: amount,
                });
            }
            wallet.balance -= amount;
        }
    }
    Ok(())
}

/// Loads the wallet, lets `f` change it and writes it back with a bumped version.
/// Nothing is written when `f` fails.
fn mutate_wallet<F>(txn: &WriteTransaction, user_id: UserId, f: F) -> Result<Wallet, LedgerError>
where
    F: FnOnce(&mut Wallet) -> Result<(), LedgerError>,
{
    let mut table = txn.open_table(TABLE_WALLETS)?;
    let key = id_key(user_id);
    let mut wallet: Wallet = load(&table, &key)?.ok_or(LedgerError::WalletNotFound(user_id))?;

    f(&mut wallet)?;
    wallet.version += 1;
    wallet.updated_at = Utc::now();
    store(&mut table, &key, &wallet)?;
    Ok(wallet)
}

fn wallet_in(txn: &WriteTransaction, user_id: UserId) -> Result<Wallet, LedgerError> {
    let table = txn.open_table(TABLE_WALLETS)?;
    load(&table, &id_key(user_id))?.ok_or(LedgerError::WalletNotFound(user_id))
}

fn ensure_reference_free(
    txn: &WriteTransaction,
    external_reference: Option<&str>,
) -> Result<(), LedgerError> {
    match external_reference {
        Some(reference) if reference_recorded_in(txn, reference)? => {
            Err(LedgerError::DuplicateReference(reference.to_string()))
        }
        _ => Ok(()),
    }
}

fn new_entry(
    txn: &WriteTransaction,
    user_id: UserId,
    kind: TransactionKind,
    amount: u64,
    source: &str,
    external_reference: Option<&str>,
) -> Result<WalletTransaction, LedgerError> {
    Ok(WalletTransaction {
        id: database::next_value(txn, TRANSACTION_COUNTER)?,
        user_id,
        kind,
        status: TransactionStatus::Pending,
        amount,
        source: source.to_string(),
        external_reference: external_reference.map(str::to_string),
        refund_of: None,
        created_at: Utc::now(),
        processed_at: None,
    })
}

/// Writes a brand new entry together with its index rows.
fn insert_entry(txn: &WriteTransaction, entry: &WalletTransaction) -> Result<(), LedgerError> {
    let key = id_key(entry.id);

    if let Some(reference) = &entry.external_reference {
        let mut references = txn.open_table(TABLE_TX_REFERENCES)?;
        if references.get(reference.as_str())?.is_some() {
            return Err(LedgerError::DuplicateReference(reference.clone()));
        }
        references.insert(reference.as_str(), key.as_str())?;
    }

    let mut history = txn.open_table(TABLE_WALLET_HISTORY)?;
    let history_key = format!("{}:{}", id_key(entry.user_id), key);
    history.insert(history_key.as_str(), key.as_str())?;

    save_entry(txn, entry)
}

fn save_entry(txn: &WriteTransaction, entry: &WalletTransaction) -> Result<(), LedgerError> {
    let mut table = txn.open_table(TABLE_TRANSACTIONS)?;
    store(&mut table, &id_key(entry.id), entry)?;
    Ok(())
}

fn load_transaction(
    txn: &WriteTransaction,
    transaction_id: TransactionId,
) -> Result<WalletTransaction, LedgerError> {
    let table = txn.open_table(TABLE_TRANSACTIONS)?;
    load(&table, &id_key(transaction_id))?
        .ok_or(LedgerError::TransactionNotFound(transaction_id))
}

fn log_result(
    operation: &str,
    user_id: UserId,
    amount: u64,
    result: &Result<WalletTransaction, LedgerError>,
) {
    match result {
        Ok(entry) => info!(
            user_id = %user_id,
            transaction = %entry.id,
            amount = %amount,
            "{operation} applied"
        ),
        Err(e) => info!(
            user_id = %user_id,
            amount = %amount,
            reason = %e,
            "{operation} skipped"
        ),
    }
}
