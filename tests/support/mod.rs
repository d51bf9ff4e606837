//! Shared helpers for the HTTP level tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tower::ServiceExt;

use linkledger::config::Config;
use linkledger::database::{init_db, AppState};
use linkledger::error::ProviderError;
use linkledger::jobs::JobQueue;
use linkledger::model::JobId;
use linkledger::provider::{
    CheckoutPreference, MerchantOrder, MerchantOrderPayment, Payment, PaymentProvider, Preference,
};
use linkledger::route::create_app;
use linkledger::shortcode::ShortCodeCodec;
use linkledger::signature;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// In-memory payment provider.
#[derive(Default)]
pub struct FakeProvider {
    payments: Mutex<HashMap<String, Payment>>,
    orders: Mutex<HashMap<String, MerchantOrder>>,
    preferences: Mutex<Vec<CheckoutPreference>>,
}

impl FakeProvider {
    pub fn add_payment(&self, id: &str, status: &str, metadata: Value) {
        let metadata = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.payments.lock().unwrap().insert(
            id.to_string(),
            Payment {
                id: id.to_string(),
                status: status.to_string(),
                metadata,
            },
        );
    }

    pub fn add_order(&self, id: &str, payment_ids: &[&str]) {
        let order = MerchantOrder {
            payments: payment_ids
                .iter()
                .map(|id| MerchantOrderPayment { id: id.to_string() })
                .collect(),
        };
        self.orders.lock().unwrap().insert(id.to_string(), order);
    }

    pub fn preferences(&self) -> Vec<CheckoutPreference> {
        self.preferences.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn payment(&self, payment_id: &str) -> Result<Payment, ProviderError> {
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                body: "payment not found".to_string(),
            })
    }

    async fn merchant_order(&self, order_id: &str) -> Result<MerchantOrder, ProviderError> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                body: "merchant order not found".to_string(),
            })
    }

    async fn create_preference(
        &self,
        preference: &CheckoutPreference,
    ) -> Result<Preference, ProviderError> {
        let mut preferences = self.preferences.lock().unwrap();
        preferences.push(preference.clone());
        let id = format!("pref-{}", preferences.len());
        Ok(Preference {
            init_point: format!("https://mercadopago.test/checkout?pref_id={id}"),
            id,
        })
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    /// Jobs dispatched by the webhook; tests run them by hand
    pub jobs: mpsc::Receiver<JobId>,
    _db_file: NamedTempFile,
}

/// Builds the application on a temporary database.
pub fn setup_test_app(configure: impl FnOnce(&mut Config)) -> TestApp {
    let db_file = NamedTempFile::new().expect("Failed to create temp file");
    let db = init_db(db_file.path().to_str().unwrap()).expect("Failed to initialize test database");

    let mut config = Config {
        mercado_pago_webhook_secret: WEBHOOK_SECRET.to_string(),
        ..Config::default()
    };
    configure(&mut config);

    let provider = Arc::new(FakeProvider::default());
    let (queue, receiver) = JobQueue::new(64);
    let state = AppState {
        db: Arc::new(db),
        codec: Arc::new(ShortCodeCodec::new(
            &config.short_code_salt,
            config.short_code_min_length,
        )),
        config: Arc::new(config),
        provider: provider.clone(),
        jobs: queue,
    };

    TestApp {
        app: create_app(state.clone()),
        state,
        provider,
        jobs: receiver,
        _db_file: db_file,
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Webhook delivery signed the way the provider signs it.
pub fn signed_webhook(uri: &str, data_id: Option<&str>, body: Value) -> Request<Body> {
    let request_id = "req-test-1";
    let ts = "1700000000";
    let digest = signature::sign(
        WEBHOOK_SECRET,
        &signature::manifest(data_id, Some(request_id), ts),
    );

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-request-id", request_id)
        .header("x-signature", format!("ts={ts},v1={digest}"))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// Sends a request and decodes the JSON body (`Null` when empty).
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();

    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("Failed to parse JSON")
    };
    (status, body)
}

/// Registers a user through the API and returns its id.
pub async fn register(app: &Router, username: &str) -> u64 {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/api/users",
            serde_json::json!({"username": username, "email": format!("{username}@example.com")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["user"]["id"].as_u64().unwrap()
}
