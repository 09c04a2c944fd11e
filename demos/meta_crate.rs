//! Example: Using the meta-crate
//!
//! Run with: `cargo run --example meta_crate`
//!
//! This example shows how to use the meta-crate which re-exports the core
//! traits together with the PostgreSQL backend.

use advisory_lock::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Example: Using advisory-lock meta-crate\n");

    let Ok(postgres_url) = std::env::var("POSTGRES_URL") else {
        println!("Set POSTGRES_URL to run this example");
        return Ok(());
    };

    println!("=== PostgreSQL Backend ===");
    let provider = PostgresLockProvider::builder()
        .connection_string(&postgres_url)
        .build()
        .await?;

    // Any provider works through the same traits.
    if let Some(handle) = provider.try_acquire_lock("example").await? {
        println!("Lock acquired through LockProviderExt");
        handle.release().await?;
    }

    // Locks can also be taken inside a transaction the caller controls.
    let connection = ExternalConnection::begin(provider.pool()).await?;
    PostgresDistributedLock::acquire_with_transaction(
        PostgresAdvisoryLockKey::from_name("example", false)?,
        &connection,
        Some(Duration::from_secs(5)),
        &CancellationToken::none(),
    )
    .await?;
    println!("Transaction-scoped lock acquired; held until commit");
    connection.commit().await?;
    connection.close().await?;

    println!("\nAll examples completed!");
    Ok(())
}
