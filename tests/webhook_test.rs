//! Mercado Pago webhook tests
//!
//! Deliveries go through the real router with a fake provider behind it.
//! Credit jobs are taken off the queue and run by hand.

mod support;

use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use serde_json::json;

use linkledger::jobs::{self, JobOutcome};
use linkledger::model::{JobStatus, TransactionKind};
use linkledger::{ledger, subscription};
use support::{json_request, register, send, setup_test_app, signed_webhook, TestApp};

const WEBHOOK: &str = "/webhooks/mercadopago";

fn payment_event(payment_id: &str) -> Request<Body> {
    signed_webhook(
        WEBHOOK,
        Some(payment_id),
        json!({"type": "payment", "action": "payment.updated", "data": {"id": payment_id}}),
    )
}

async fn run_next_job(t: &mut TestApp) -> Result<JobOutcome, linkledger::error::JobError> {
    let job_id = t.jobs.try_recv().expect("a job should have been dispatched");
    jobs::run_job(t.state.db.clone(), job_id, t.state.config.retry_policy()).await
}

#[tokio::test]
async fn test_credit_is_applied_once() {
    let mut t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    t.provider.add_payment(
        "123",
        "approved",
        json!({"type": "credits", "user_id": user_id.to_string(), "amount": "50"}),
    );

    let (status, body) = send(&t.app, payment_event("123")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    // Redelivery before the worker ran: same job, not dispatched twice
    let (status, body) = send(&t.app, payment_event("123")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    assert_eq!(run_next_job(&mut t).await.unwrap(), JobOutcome::Completed);
    assert!(t.jobs.try_recv().is_err());

    let (status, body) = send(&t.app, payment_event("123")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_processed");

    let wallet = ledger::get_wallet(&t.state.db, user_id).unwrap().unwrap();
    assert_eq!(wallet.balance, 55);

    let credits: Vec<_> = ledger::history(&t.state.db, user_id)
        .unwrap()
        .into_iter()
        .filter(|tx| tx.external_reference.as_deref() == Some("123"))
        .collect();
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].kind, TransactionKind::Credit);
    assert_eq!(credits[0].amount, 50);
    assert_eq!(credits[0].source, "Mercado Pago credit: 50");

    let job = jobs::job_for_payment(&t.state.db, "123").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_bad_signatures_are_ignored() {
    let mut t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    t.provider.add_payment(
        "123",
        "approved",
        json!({"type": "credits", "user_id": user_id, "amount": 50}),
    );
    let body = json!({"type": "payment", "data": {"id": "123"}});

    let unsigned = Request::builder()
        .method("POST")
        .uri(WEBHOOK)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, response) = send(&t.app, unsigned).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");

    let forged = Request::builder()
        .method("POST")
        .uri(WEBHOOK)
        .header("content-type", "application/json")
        .header("x-request-id", "req-test-1")
        .header("x-signature", format!("ts=1700000000,v1={}", "ab".repeat(32)))
        .body(Body::from(body.to_string()))
        .unwrap();
    let (_, response) = send(&t.app, forged).await;
    assert_eq!(response["status"], "ignored");

    // Signed for a different payment
    let replayed = signed_webhook(WEBHOOK, Some("999"), body);
    let (_, response) = send(&t.app, replayed).await;
    assert_eq!(response["status"], "ignored");

    assert!(t.jobs.try_recv().is_err());
    assert!(jobs::job_for_payment(&t.state.db, "123").unwrap().is_none());
}

#[tokio::test]
async fn test_missing_secret_ignores_everything() {
    let t = setup_test_app(|config| config.mercado_pago_webhook_secret = String::new());

    let (status, body) = send(&t.app, payment_event("123")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_unapproved_payment_is_pending() {
    let t = setup_test_app(|_| {});
    t.provider.add_payment(
        "321",
        "in_process",
        json!({"type": "credits", "user_id": "1", "amount": "10"}),
    );

    let (status, body) = send(&t.app, payment_event("321")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn test_unknown_topic_is_ignored() {
    let t = setup_test_app(|_| {});

    let request = signed_webhook(
        WEBHOOK,
        Some("55"),
        json!({"type": "chargebacks", "data": {"id": "55"}}),
    );
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_merchant_order_without_payments_waits() {
    let t = setup_test_app(|_| {});
    t.provider.add_order("900", &[]);

    let request = signed_webhook(
        WEBHOOK,
        Some("900"),
        json!({"topic": "merchant_order", "data": {"id": "900"}}),
    );
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "waiting_payment");
}

#[tokio::test]
async fn test_merchant_order_resolves_first_payment() {
    let mut t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    t.provider.add_order("901", &["124", "125"]);
    t.provider.add_payment(
        "124",
        "approved",
        json!({"type": "credits", "user_id": user_id, "amount": 20}),
    );

    let uri = format!("{WEBHOOK}?topic=merchant_order&data.id=901");
    let (status, body) = send(&t.app, signed_webhook(&uri, Some("901"), json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    assert_eq!(run_next_job(&mut t).await.unwrap(), JobOutcome::Completed);
    let wallet = ledger::get_wallet(&t.state.db, user_id).unwrap().unwrap();
    assert_eq!(wallet.balance, 25);
}

#[tokio::test]
async fn test_form_encoded_delivery() {
    let mut t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    t.provider.add_payment(
        "777",
        "approved",
        json!({"type": "credits", "user_id": user_id.to_string(), "amount": "10.0"}),
    );

    let signed = signed_webhook(WEBHOOK, Some("777"), json!({}));
    let (parts, _) = signed.into_parts();
    let mut request = Request::from_parts(parts, Body::from("topic=payment&data.id=777"));
    request.headers_mut().insert(
        "content-type",
        "application/x-www-form-urlencoded".parse().unwrap(),
    );

    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    assert_eq!(run_next_job(&mut t).await.unwrap(), JobOutcome::Completed);
    let wallet = ledger::get_wallet(&t.state.db, user_id).unwrap().unwrap();
    assert_eq!(wallet.balance, 15);
}

#[tokio::test]
async fn test_credit_metadata_must_be_complete() {
    let t = setup_test_app(|_| {});
    t.provider
        .add_payment("400", "approved", json!({"type": "credits", "amount": "10"}));
    t.provider.add_payment("401", "approved", json!({"user_id": "1"}));

    let (_, body) = send(&t.app, payment_event("400")).await;
    assert_eq!(body["status"], "ignored");
    let (_, body) = send(&t.app, payment_event("401")).await;
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_provider_failure_is_bad_gateway() {
    let t = setup_test_app(|_| {});

    let (status, body) = send(&t.app, payment_event("does-not-exist")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "provider_error");
}

#[tokio::test]
async fn test_failed_job_is_revived_on_redelivery() {
    let mut t = setup_test_app(|config| {
        config.job_max_attempts = 1;
        config.job_retry_delay = Duration::ZERO;
    });
    t.provider.add_payment(
        "500",
        "approved",
        json!({"type": "credits", "user_id": "42", "amount": "10"}),
    );

    let (_, body) = send(&t.app, payment_event("500")).await;
    assert_eq!(body["status"], "queued");
    assert!(run_next_job(&mut t).await.is_err());

    let job = jobs::job_for_payment(&t.state.db, "500").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.is_some());

    let (_, body) = send(&t.app, payment_event("500")).await;
    assert_eq!(body["status"], "queued");

    let revived = jobs::job_for_payment(&t.state.db, "500").unwrap().unwrap();
    assert_eq!(revived.id, job.id);
    assert_eq!(revived.status, JobStatus::Queued);
    assert_eq!(revived.attempts, 0);
    assert_eq!(t.jobs.try_recv().unwrap(), job.id);
}

#[tokio::test]
async fn test_plan_payment_activates_subscription_once() {
    let t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    let (_, plan) = send(
        &t.app,
        json_request("POST", "/api/plans", json!({"name": "Pro", "price_cents": 1990})),
    )
    .await;
    let plan_id = plan["id"].as_u64().unwrap();
    t.provider.add_payment(
        "600",
        "approved",
        json!({"type": "plan", "user_id": user_id.to_string(), "plan_id": plan_id.to_string()}),
    );

    let (status, body) = send(&t.app, payment_event("600")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "subscription_activated");

    let (status, body) = send(&t.app, payment_event("600")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_processed");

    let (active, active_plan) = subscription::active_plan(&t.state.db, user_id)
        .unwrap()
        .unwrap();
    assert_eq!(active_plan.id, plan_id);
    assert!(active.auto_renew);
    assert_eq!(active.external_reference.as_deref(), Some("600"));

    // No coins move for a plan purchase
    let wallet = ledger::get_wallet(&t.state.db, user_id).unwrap().unwrap();
    assert_eq!(wallet.balance, 5);
}

#[tokio::test]
async fn test_plan_payment_for_unknown_plan_is_not_found() {
    let t = setup_test_app(|_| {});
    let user_id = register(&t.app, "alice").await;
    t.provider.add_payment(
        "601",
        "approved",
        json!({"type": "plan", "user_id": user_id, "plan_id": 77}),
    );

    let (status, _) = send(&t.app, payment_event("601")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(subscription::active_plan(&t.state.db, user_id).unwrap().is_none());
}
