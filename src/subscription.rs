//! Plans and user subscriptions
//!
//! A user holds at most one ACTIVE subscription. Activating a plan demotes
//! whatever else is active for that user to INACTIVE, then creates or revives
//! the single row kept per (user, plan).

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, WriteTransaction};
use tracing::info;

use crate::accounts;
use crate::database::{
    self, id_key, load, load_all, scan_prefix, snapshot, store, TABLE_PLANS, TABLE_PLAN_NAMES,
    TABLE_SUBSCRIPTIONS, TABLE_SUBSCRIPTION_REFERENCES, TABLE_USER_PLANS,
};
use crate::error::{StoreError, SubscriptionError};
use crate::model::{
    NewPlan, Plan, PlanId, SubscriptionId, SubscriptionStatus, UserId, UserSubscription,
};

const PLAN_COUNTER: &str = "plans";
const SUBSCRIPTION_COUNTER: &str = "subscriptions";

/// Length of a subscription period when no end date is given.
pub const DEFAULT_PERIOD_DAYS: i64 = 30;

/// Creates a plan. Names are unique.
pub fn create_plan(txn: &WriteTransaction, new_plan: &NewPlan) -> Result<Plan, SubscriptionError> {
    let name = new_plan.name.trim();
    {
        let names = txn.open_table(TABLE_PLAN_NAMES)?;
        if names.get(name)?.is_some() {
            return Err(SubscriptionError::DuplicatePlanName(name.to_string()));
        }
    }

    let plan = Plan {
        id: database::next_value(txn, PLAN_COUNTER)?,
        name: name.to_string(),
        monthly_credits: new_plan.monthly_credits,
        price_cents: new_plan.price_cents,
        disable_interstitial_page: new_plan.disable_interstitial_page,
        advanced_stats: new_plan.advanced_stats,
        longtime_expiration_date: new_plan.longtime_expiration_date,
        conditional_redirect: new_plan.conditional_redirect,
        priority_support: new_plan.priority_support,
        created_at: Utc::now(),
    };

    let key = id_key(plan.id);
    txn.open_table(TABLE_PLAN_NAMES)?
        .insert(plan.name.as_str(), key.as_str())?;
    store(&mut txn.open_table(TABLE_PLANS)?, &key, &plan)?;

    info!(plan_id = %plan.id, name = %plan.name, "plan created");
    Ok(plan)
}

pub fn get_plan(db: &Database, plan_id: PlanId) -> Result<Option<Plan>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_PLANS)?;
        load(&table, &id_key(plan_id))
    })
}

pub fn get_subscription(
    db: &Database,
    subscription_id: SubscriptionId,
) -> Result<Option<UserSubscription>, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_SUBSCRIPTIONS)?;
        load(&table, &id_key(subscription_id))
    })
}

/// Makes `plan_id` the user's only active plan.
///
/// `end_date` defaults to [`DEFAULT_PERIOD_DAYS`] from now. `external_reference`
/// is the provider payment that paid for the activation, when there is one.
pub fn activate_plan(
    txn: &WriteTransaction,
    user_id: UserId,
    plan_id: PlanId,
    auto_renew: bool,
    end_date: Option<DateTime<Utc>>,
    external_reference: Option<&str>,
) -> Result<UserSubscription, SubscriptionError> {
    if !accounts::user_exists(txn, user_id)? {
        return Err(SubscriptionError::UserNotFound(user_id));
    }
    {
        let plans = txn.open_table(TABLE_PLANS)?;
        if plans.get(id_key(plan_id).as_str())?.is_none() {
            return Err(SubscriptionError::PlanNotFound(plan_id));
        }
    }

    let now = Utc::now();
    let mut subscriptions = txn.open_table(TABLE_SUBSCRIPTIONS)?;

    let user_plans = txn.open_table(TABLE_USER_PLANS)?;
    let owned = scan_prefix(&user_plans, &format!("{}:", id_key(user_id)))?;
    let plan_key = format!("{}:{}", id_key(user_id), id_key(plan_id));
    let mut existing = None;
    for (key, subscription_key) in owned {
        let Some(mut subscription) = load::<UserSubscription>(&subscriptions, &subscription_key)?
        else {
            continue;
        };
        if key == plan_key {
            existing = Some(subscription);
            continue;
        }
        if subscription.status == SubscriptionStatus::Active {
            subscription.status = SubscriptionStatus::Inactive;
            subscription.updated_at = now;
            store(&mut subscriptions, &subscription_key, &subscription)?;
            info!(user_id = %user_id, subscription_id = %subscription.id, "subscription demoted");
        }
    }
    drop(user_plans);

    let end_date = end_date.unwrap_or(now + Duration::days(DEFAULT_PERIOD_DAYS));
    let subscription = match existing {
        Some(mut subscription) => {
            subscription.status = SubscriptionStatus::Active;
            subscription.start_date = now;
            subscription.end_date = Some(end_date);
            subscription.auto_renew = auto_renew;
            subscription.updated_at = now;
            if let Some(reference) = external_reference {
                subscription.external_reference = Some(reference.to_string());
            }
            subscription
        }
        None => {
            let subscription = UserSubscription {
                id: database::next_value(txn, SUBSCRIPTION_COUNTER)?,
                user_id,
                plan_id,
                status: SubscriptionStatus::Active,
                start_date: now,
                end_date: Some(end_date),
                auto_renew,
                external_reference: external_reference.map(str::to_string),
                updated_at: now,
            };
            txn.open_table(TABLE_USER_PLANS)?
                .insert(plan_key.as_str(), id_key(subscription.id).as_str())?;
            subscription
        }
    };

    let key = id_key(subscription.id);
    store(&mut subscriptions, &key, &subscription)?;
    if let Some(reference) = external_reference {
        txn.open_table(TABLE_SUBSCRIPTION_REFERENCES)?
            .insert(reference, key.as_str())?;
    }

    info!(
        user_id = %user_id,
        plan_id = %plan_id,
        subscription_id = %subscription.id,
        "plan activated"
    );
    Ok(subscription)
}

/// Explicit cancellation: CANCELED and no renewal.
pub fn cancel(
    txn: &WriteTransaction,
    subscription_id: SubscriptionId,
) -> Result<UserSubscription, SubscriptionError> {
    let mut table = txn.open_table(TABLE_SUBSCRIPTIONS)?;
    let key = id_key(subscription_id);
    let mut subscription: UserSubscription = load(&table, &key)?
        .ok_or(SubscriptionError::SubscriptionNotFound(subscription_id))?;

    subscription.status = SubscriptionStatus::Canceled;
    subscription.auto_renew = false;
    subscription.updated_at = Utc::now();
    store(&mut table, &key, &subscription)?;

    info!(
        user_id = %subscription.user_id,
        subscription_id = %subscription_id,
        "subscription canceled"
    );
    Ok(subscription)
}

/// Moves lapsed, non-renewing ACTIVE subscriptions to INACTIVE.
///
/// Returns how many were changed.
pub fn expire_subscriptions(db: &Database, now: DateTime<Utc>) -> Result<usize, StoreError> {
    database::atomic(db, |txn| {
        let mut table = txn.open_table(TABLE_SUBSCRIPTIONS)?;
        let lapsed: Vec<UserSubscription> = load_all::<UserSubscription>(&table)?
            .into_iter()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && !s.auto_renew
                    && s.end_date.is_some_and(|end| end < now)
            })
            .collect();

        for mut subscription in lapsed.iter().cloned() {
            subscription.status = SubscriptionStatus::Inactive;
            subscription.updated_at = now;
            store(&mut table, &id_key(subscription.id), &subscription)?;
        }

        if !lapsed.is_empty() {
            info!(count = lapsed.len(), "expired subscriptions disabled");
        }
        Ok(lapsed.len())
    })
}

/// The user's active subscription together with its plan.
pub fn active_plan(
    db: &Database,
    user_id: UserId,
) -> Result<Option<(UserSubscription, Plan)>, StoreError> {
    snapshot(db, |txn| {
        let user_plans = txn.open_table(TABLE_USER_PLANS)?;
        let subscriptions = txn.open_table(TABLE_SUBSCRIPTIONS)?;
        let plans = txn.open_table(TABLE_PLANS)?;

        for (_, subscription_key) in scan_prefix(&user_plans, &format!("{}:", id_key(user_id)))? {
            let Some(subscription) = load::<UserSubscription>(&subscriptions, &subscription_key)?
            else {
                continue;
            };
            if subscription.status != SubscriptionStatus::Active {
                continue;
            }
            if let Some(plan) = load::<Plan>(&plans, &id_key(subscription.plan_id))? {
                return Ok(Some((subscription, plan)));
            }
        }
        Ok(None)
    })
}

/// Whether the user's plan lets their links skip the interstitial page.
pub fn interstitial_disabled(db: &Database, user_id: UserId) -> Result<bool, StoreError> {
    Ok(active_plan(db, user_id)?.is_some_and(|(_, plan)| plan.disable_interstitial_page))
}

/// Whether a subscription was already activated by this provider payment.
pub fn reference_recorded_in(txn: &WriteTransaction, reference: &str) -> Result<bool, StoreError> {
    let table = txn.open_table(TABLE_SUBSCRIPTION_REFERENCES)?;
    let recorded = table.get(reference)?.is_some();
    Ok(recorded)
}

pub fn reference_recorded(db: &Database, reference: &str) -> Result<bool, StoreError> {
    snapshot(db, |txn| {
        let table = txn.open_table(TABLE_SUBSCRIPTION_REFERENCES)?;
        let recorded = table.get(reference)?.is_some();
        Ok(recorded)
    })
}
