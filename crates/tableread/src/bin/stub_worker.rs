//! Standalone stub worker binary.
//!
//! Behaves like the real render worker from the supervisor's point of view:
//! reads `PORT` from the environment, binds loopback, and serves the worker
//! HTTP contract. Test-only knobs:
//!
//! - `STUB_PID_FILE`: write the process id here right after launch
//! - `STUB_STARTUP_DELAY_MS`: wait this long before binding
//! - `STUB_EXIT_CODE`: exit with this code instead of serving

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tableread::init_tracing();

    if let Ok(path) = std::env::var("STUB_PID_FILE") {
        tokio::fs::write(&path, std::process::id().to_string())
            .await
            .with_context(|| format!("failed to write pid file {path}"))?;
    }

    if let Ok(code) = std::env::var("STUB_EXIT_CODE") {
        let code: i32 = code.parse().context("STUB_EXIT_CODE is not a number")?;
        info!(code, "exiting early as instructed");
        std::process::exit(code);
    }

    if let Ok(delay) = std::env::var("STUB_STARTUP_DELAY_MS") {
        let delay: u64 = delay
            .parse()
            .context("STUB_STARTUP_DELAY_MS is not a number")?;
        info!(delay_ms = delay, "delaying startup as instructed");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let port: u16 = std::env::var("PORT")
        .context("PORT is not set; the supervisor provides it")?
        .parse()
        .context("PORT is not a valid port number")?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{port}"))?;
    tableread::stub::serve(listener).await?;
    Ok(())
}
