//! User registration and outgoing mail
//!
//! Registration is one explicit command. Creating the user, opening the
//! wallet, granting the signup bonus and queueing the welcome email all commit
//! in the same write transaction. Mail leaves the process later, when the
//! outbox is drained through a [`Mailer`].

use chrono::Utc;
use redb::{Database, ReadableTable, WriteTransaction};
use tracing::{info, warn};

use crate::database::{
    self, atomic, id_key, load, load_all, store, TABLE_OUTBOX, TABLE_USERNAMES, TABLE_USERS,
};
use crate::error::{AccountError, StoreError};
use crate::ledger;
use crate::model::{OutboxMessage, RegisterRequest, User, UserId};

const USER_COUNTER: &str = "users";
const OUTBOX_COUNTER: &str = "outbox";

/// Delivery attempts before a message is left for an operator.
pub const MAX_MAIL_ATTEMPTS: u32 = 5;

/// Messages handed to the mailer per drain.
const OUTBOX_BATCH: usize = 20;

#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    /// `false` when the username was already taken and the existing user is returned
    pub created: bool,
}

/// Sends one outbox message.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &OutboxMessage) -> Result<(), AccountError>;
}

/// Mailer that only writes the message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &OutboxMessage) -> Result<(), AccountError> {
        info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "email sent"
        );
        Ok(())
    }
}

/// Registers a user, opens their wallet and grants `signup_bonus` coins.
///
/// The bonus is only granted while the wallet is still empty, so running the
/// command again for the same username never pays twice.
pub fn register_user(
    db: &Database,
    request: &RegisterRequest,
    signup_bonus: u64,
) -> Result<Registration, AccountError> {
    let username = request.username.trim();
    let email = request.email.trim();
    if username.is_empty() {
        return Err(AccountError::InvalidUsername);
    }
    if !is_valid_email(email) {
        return Err(AccountError::InvalidEmail);
    }

    atomic(db, |txn| {
        if let Some(user) = find_by_username(txn, username)? {
            return Ok(Registration {
                user,
                created: false,
            });
        }

        let user = User {
            id: database::next_value(txn, USER_COUNTER)?,
            username: username.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        let key = id_key(user.id);
        store(&mut txn.open_table(TABLE_USERS)?, &key, &user)?;
        txn.open_table(TABLE_USERNAMES)?
            .insert(user.username.as_str(), key.as_str())?;

        let (wallet, _) = ledger::open_wallet(txn, user.id)?;
        if wallet.balance == 0 && signup_bonus > 0 {
            let source = format!("{signup_bonus} free coins for signing up");
            ledger::credit(txn, user.id, signup_bonus, &source, None)?;
        }

        queue_mail(
            txn,
            &user,
            "Welcome!",
            &format!("Hello {}, welcome to our platform!", user.username),
        )?;

        info!(user_id = %user.id, username = %user.username, "user registered");
        Ok(Registration {
            user,
            created: true,
        })
    })
}

pub fn get_user(db: &Database, user_id: UserId) -> Result<Option<User>, StoreError> {
    database::snapshot(db, |txn| {
        let table = txn.open_table(TABLE_USERS)?;
        load(&table, &id_key(user_id))
    })
}

pub fn user_exists(txn: &WriteTransaction, user_id: UserId) -> Result<bool, StoreError> {
    let table = txn.open_table(TABLE_USERS)?;
    let exists = table.get(id_key(user_id).as_str())?.is_some();
    Ok(exists)
}

fn find_by_username(txn: &WriteTransaction, username: &str) -> Result<Option<User>, StoreError> {
    let usernames = txn.open_table(TABLE_USERNAMES)?;
    let Some(user_key) = usernames.get(username)?.map(|guard| guard.value().to_string()) else {
        return Ok(None);
    };
    let users = txn.open_table(TABLE_USERS)?;
    load(&users, &user_key)
}

fn queue_mail(
    txn: &WriteTransaction,
    user: &User,
    subject: &str,
    body: &str,
) -> Result<OutboxMessage, StoreError> {
    let message = OutboxMessage {
        id: database::next_value(txn, OUTBOX_COUNTER)?,
        user_id: user.id,
        recipient: user.email.clone(),
        subject: subject.to_string(),
        body: body.to_string(),
        attempts: 0,
        last_error: None,
        created_at: Utc::now(),
        delivered_at: None,
    };
    store(&mut txn.open_table(TABLE_OUTBOX)?, &id_key(message.id), &message)?;
    Ok(message)
}

/// Sends pending outbox messages, oldest first. Returns how many were delivered.
pub fn deliver_outbox(db: &Database, mailer: &dyn Mailer) -> Result<usize, StoreError> {
    atomic(db, |txn| {
        let mut table = txn.open_table(TABLE_OUTBOX)?;
        let pending: Vec<OutboxMessage> = load_all::<OutboxMessage>(&table)?
            .into_iter()
            .filter(|m| m.delivered_at.is_none() && m.attempts < MAX_MAIL_ATTEMPTS)
            .take(OUTBOX_BATCH)
            .collect();

        let mut delivered = 0;
        for mut message in pending {
            match mailer.send(&message) {
                Ok(()) => {
                    message.delivered_at = Some(Utc::now());
                    delivered += 1;
                }
                Err(e) => {
                    message.attempts += 1;
                    message.last_error = Some(e.to_string());
                    warn!(
                        message_id = %message.id,
                        attempts = message.attempts,
                        error = %e,
                        "email delivery failed"
                    );
                }
            }
            store(&mut table, &id_key(message.id), &message)?;
        }
        Ok(delivered)
    })
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
