// src/main.rs
// Process bootstrap: env, logging, config, gateway connectivity check, then
// hand control to the engine loop.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderblock_bot::config::Config;
use orderblock_bot::engine::Engine;
use orderblock_bot::exchange::rest::RestGateway;
use orderblock_bot::exchange::ExchangeGateway;
use orderblock_bot::persistence::Store;

// Console plus a daily rotating file under logs/
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::daily("logs", "orderblock_bot");

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_level(true)
                .with_ansi(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let config = Config::from_env()?;
    info!(
        "Starting order block bot: {} pairs on {} timeframe",
        config.trading_pairs.len(),
        config.timeframe
    );

    let gateway = RestGateway::new(&config);

    // No degraded mode without exchange access: an unreachable exchange at
    // startup stops the process here
    let balance = gateway.fetch_balance().await?;
    info!(
        "Connected to exchange, balance: {:.2} total / {:.2} free",
        balance.total, balance.free
    );

    let store = Store::new(&config.data_dir);
    let mut engine = Engine::new(gateway, store, config);
    engine.run().await;
    Ok(())
}
