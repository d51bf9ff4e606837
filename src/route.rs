//! Route definitions for the link shortener API
//!
//! This module configures all HTTP routes and maps them to their respective handlers.
//! It creates the Axum router with the application state.

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::database::AppState;
use crate::handler::{
    cancel_subscription, checkout, create_plan, create_short_url, delete_short_url, get_wallet,
    list_urls, mercadopago_webhook, redirect_url, refund_transaction, register_user,
};
use crate::middleware::auth_middleware;

/// Creates and configures the Axum application router with all routes
///
/// # Route Definitions
///
/// - `GET /{code}` - Follows a short URL (public)
/// - `POST /webhooks/mercadopago` - Payment notifications (public, signed)
/// - `POST /api/users` - Registers a user
/// - `GET /api/urls` - Lists a user's URLs with pagination
/// - `POST /api/urls` - Creates a new short URL
/// - `DELETE /api/urls/{code}` - Deletes a short URL (creator only)
/// - `GET /api/wallets/{user_id}` - Wallet balance and history
/// - `POST /api/transactions/{id}/refund` - Refunds a transaction
/// - `POST /api/plans` - Creates a plan
/// - `POST /api/subscriptions/{id}/cancel` - Cancels a subscription
/// - `POST /api/checkout` - Starts a Mercado Pago checkout
///
/// Everything under `/api` goes through [`auth_middleware`].
///
/// # Example Usage
///
/// ```no_run
/// # use linkledger::database::AppState;
/// # use linkledger::route::create_app;
/// # fn build(state: AppState) {
/// let app = create_app(state);
/// // axum::serve(listener, app).await.unwrap();
/// # }
/// ```
pub fn create_app(state: AppState) -> Router {
    // API routes that require authorization check
    let api_routes = Router::new()
        .route("/users", post(register_user))
        .route("/urls", get(list_urls).post(create_short_url))
        .route("/urls/{code}", delete(delete_short_url))
        .route("/wallets/{user_id}", get(get_wallet))
        .route("/transactions/{id}/refund", post(refund_transaction))
        .route("/plans", post(create_plan))
        .route("/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/checkout", post(checkout))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/{code}", get(redirect_url))
        .route("/webhooks/mercadopago", post(mercadopago_webhook))
        .nest("/api", api_routes)
        .with_state(state)
}
