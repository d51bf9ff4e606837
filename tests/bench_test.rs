//! Benchmark tests for critical operations
//!
//! Run with: cargo test --release bench -- --ignored --nocapture

use std::sync::Arc;
use std::time::Instant;

use redb::Database;
use tempfile::NamedTempFile;

use linkledger::accounts::register_user;
use linkledger::config::Config;
use linkledger::database::{atomic, init_db};
use linkledger::error::LedgerError;
use linkledger::ledger;
use linkledger::model::{RegisterRequest, UrlMetadata};
use linkledger::shortcode::ShortCodeCodec;
use linkledger::shortening::{self, ShortenCommand};

/// Benchmark helper to measure execution time
fn benchmark<F>(name: &str, iterations: usize, mut f: F)
where
    F: FnMut(usize),
{
    let start = Instant::now();

    for i in 0..iterations {
        f(i);
    }

    let duration = start.elapsed();
    let avg_ms = duration.as_millis() as f64 / iterations as f64;
    let ops_per_sec = (iterations as f64 / duration.as_secs_f64()) as u64;

    println!("  {} ({} iterations)", name, iterations);
    println!("    Total time: {:?}", duration);
    println!("    Avg time: {:.3}ms", avg_ms);
    println!("    Throughput: {} ops/sec\n", ops_per_sec);
}

fn setup(signup_bonus: u64) -> (Database, NamedTempFile, u64) {
    let temp_db = NamedTempFile::new().unwrap();
    let db = init_db(temp_db.path().to_str().unwrap()).unwrap();
    let request = RegisterRequest {
        username: "bench_user".to_string(),
        email: "bench@example.com".to_string(),
    };
    let user_id = register_user(&db, &request, signup_bonus).unwrap().user.id;
    (db, temp_db, user_id)
}

#[test]
#[ignore] // Run explicitly with: cargo test bench --release -- --ignored --nocapture
fn bench_create_urls() {
    println!("\n=== Benchmark: Create URLs ===\n");

    let (db, _temp_db, user_id) = setup(1_000_000);
    let config = Config::default();
    let codec = ShortCodeCodec::new(&config.short_code_salt, config.short_code_min_length);

    benchmark("Create as user (charged)", 1000, |i| {
        let url = format!("https://example.com/bench/{i}");
        let command = ShortenCommand {
            user_id: Some(user_id),
            client_ip: "127.0.0.1",
            original_url: &url,
            metadata: UrlMetadata::default(),
            create_new: false,
        };
        shortening::shorten(&db, &codec, &config, &command).unwrap();
    });

    benchmark("Create anonymous", 1000, |i| {
        let url = format!("https://example.com/public/{i}");
        let command = ShortenCommand {
            user_id: None,
            client_ip: "127.0.0.1",
            original_url: &url,
            metadata: UrlMetadata::default(),
            create_new: false,
        };
        shortening::shorten(&db, &codec, &config, &command).unwrap();
    });

    benchmark("List first page", 1000, |_| {
        shortening::list_urls(&db, user_id, 1, 10).unwrap();
    });
}

#[test]
#[ignore]
fn bench_ledger_mutations() {
    println!("\n=== Benchmark: Ledger ===\n");

    let (db, _temp_db, user_id) = setup(0);

    benchmark("Credit", 1000, |i| {
        atomic(&db, |txn| {
            ledger::credit(txn, user_id, 10, "bench credit", Some(&format!("bench-{i}")))
        })
        .unwrap();
    });

    benchmark("Debit", 1000, |_| {
        atomic(&db, |txn| ledger::debit(txn, user_id, 1, "bench debit", None)).unwrap();
    });

    benchmark("History", 100, |_| {
        ledger::history(&db, user_id).unwrap();
    });
}

#[tokio::test]
#[ignore]
async fn bench_concurrent_debits() {
    println!("\n=== Benchmark: Concurrent Debits ===\n");

    let (db, _temp_db, user_id) = setup(500);
    let db = Arc::new(db);

    let num_tasks = 100;
    let ops_per_task = 10;

    println!("  Running {} concurrent tasks with {} ops each...", num_tasks, ops_per_task);

    let start = Instant::now();
    let mut handles = vec![];

    for _ in 0..num_tasks {
        let db = Arc::clone(&db);
        handles.push(tokio::task::spawn_blocking(move || {
            let mut failed = 0;
            for _ in 0..ops_per_task {
                let result = atomic(&db, |txn| ledger::debit(txn, user_id, 1, "concurrent", None));
                if let Err(LedgerError::InsufficientBalance { .. }) = result {
                    failed += 1;
                }
            }
            failed
        }));
    }

    let mut rejected = 0;
    for handle in handles {
        rejected += handle.await.unwrap();
    }

    let duration = start.elapsed();
    let total_ops = num_tasks * ops_per_task;

    // 1000 debits of 1 against 500 coins: exactly half succeed
    let wallet = ledger::get_wallet(&db, user_id).unwrap().unwrap();
    assert_eq!(wallet.balance, 0);
    assert_eq!(rejected, 500);

    println!("  Total operations: {}", total_ops);
    println!("  Total time: {:?}", duration);
    println!(
        "  Throughput: {:.0} ops/sec\n",
        total_ops as f64 / duration.as_secs_f64()
    );
}

#[test]
fn bench_summary() {
    println!("\n{}", "=".repeat(60));
    println!("Benchmark Test Suite");
    println!("{}", "=".repeat(60));
    println!("\nTo run benchmarks, use:");
    println!("  cargo test --release bench -- --ignored --nocapture");
    println!("\nAvailable benchmarks:");
    println!("  • bench_create_urls        - Link creation and listing");
    println!("  • bench_ledger_mutations   - Credit, debit and history reads");
    println!("  • bench_concurrent_debits  - Balance consistency under contention");
    println!("\n{}\n", "=".repeat(60));
}
