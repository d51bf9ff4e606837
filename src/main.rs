//! Application entry point and server initialization
//!
//! This module contains the main function that:
//! - Loads environment configuration
//! - Initializes the database and the payment provider client
//! - Starts the credit workers and the maintenance loop
//! - Starts the HTTP server with graceful shutdown support

use std::sync::Arc;

use chrono::Utc;
use dotenvy::dotenv;
use redb::Database;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linkledger::accounts::{self, LogMailer};
use linkledger::config::Config;
use linkledger::database::{init_db, AppState};
use linkledger::jobs::{self, JobQueue};
use linkledger::provider::MercadoPagoClient;
use linkledger::route::create_app;
use linkledger::shortcode::ShortCodeCodec;
use linkledger::{shortening, subscription};

/// Capacity of the credit job channel
const JOB_QUEUE_CAPACITY: usize = 256;

/// Application entry point
///
/// This asynchronous main function:
/// 1. Loads environment variables from .env file
/// 2. Reads the configuration (see [`Config`])
/// 3. Initializes the embedded database
/// 4. Starts the credit workers and re-dispatches jobs left queued by a previous run
/// 5. Creates the application state and router
/// 6. Starts the HTTP server with graceful shutdown handling
#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("linkledger=debug,tower_http=debug")),
        )
        .init();

    let config = Config::from_env().expect("Invalid configuration");
    if config.mercado_pago_webhook_secret.is_empty() {
        error!("MERCADO_PAGO_WEBHOOK_SECRET is not set, every webhook will be ignored");
    }

    let db = Arc::new(init_db(&config.database_url).expect("Failed to initialize database"));
    let codec = ShortCodeCodec::new(&config.short_code_salt, config.short_code_min_length);
    let provider = MercadoPagoClient::new(
        &config.mercado_pago_api_url,
        &config.mercado_pago_access_token,
    );

    let (queue, receiver) = JobQueue::new(JOB_QUEUE_CAPACITY);
    jobs::spawn_workers(
        Arc::clone(&db),
        receiver,
        config.retry_policy(),
        config.job_workers,
    );
    match queue.requeue_pending(&db).await {
        Ok(0) => {}
        Ok(count) => info!(count = count, "re-dispatched queued credit jobs"),
        Err(e) => error!(error = %e, "failed to re-dispatch queued credit jobs"),
    }

    tokio::spawn(maintenance_loop(Arc::clone(&db), config.maintenance_interval));

    let port = config.port;
    let db_name = config.database_url.clone();
    let state = AppState {
        db,
        config: Arc::new(config),
        codec: Arc::new(codec),
        provider: Arc::new(provider),
        jobs: queue,
    };

    // Create the Axum router with all routes configured
    let app = create_app(state).layer(TraceLayer::new_for_http());

    // Bind to all network interfaces on the specified port
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await.unwrap();

    // Print startup information
    println!("🚀 Server running at http://localhost:{}", port);
    println!("📂 Using database: {}", db_name);

    // Start the server with graceful shutdown support
    // The server will continue running until it receives SIGTERM or SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

/// Periodic housekeeping: expired links, lapsed subscriptions and the mail outbox.
async fn maintenance_loop(db: Arc<Database>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;

        let db = Arc::clone(&db);
        let result = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let urls = shortening::delete_expired_urls(&db, now)?;
            let subscriptions = subscription::expire_subscriptions(&db, now)?;
            let mails = accounts::deliver_outbox(&db, &LogMailer)?;
            Ok::<_, linkledger::error::StoreError>((urls, subscriptions, mails))
        })
        .await;

        match result {
            Ok(Ok((urls, subscriptions, mails))) => info!(
                expired_urls = urls,
                expired_subscriptions = subscriptions,
                mails_sent = mails,
                "maintenance pass finished"
            ),
            Ok(Err(e)) => error!(error = %e, "maintenance pass failed"),
            Err(e) => error!(error = %e, "maintenance task panicked"),
        }
    }
}

/// Handles graceful shutdown signals
///
/// This function listens for shutdown signals and returns when one is received:
/// - SIGINT (Ctrl+C) - Interrupt signal from terminal
/// - SIGTERM - Termination signal (common in Docker/Kubernetes)
///
/// Open connections are allowed to complete before the process exits, so no
/// database write transaction is cut off halfway.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    println!("\n🛑 Shutdown signal received, stopping server.");
}
