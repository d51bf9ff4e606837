//! Link shortener with a coin wallet ledger and Mercado Pago billing
//!
//! This module exposes internal components for the server binary and for testing.

pub mod accounts;
pub mod config;
pub mod database;
pub mod error;
pub mod handler;
pub mod jobs;
pub mod ledger;
pub mod middleware;
pub mod model;
pub mod pricing;
pub mod provider;
pub mod reconcile;
pub mod route;
pub mod shortcode;
pub mod shortening;
pub mod signature;
pub mod subscription;
