//! myst-vpn: session coordinator demo
//!
//! Runs one session against the in-process simulated node: bind, load
//! identity, connect, a few statistics ticks, disconnect.
//!
//! Usage: `myst-vpn [config.toml|config.json]`

use anyhow::{Context, Result};
use myst_session::sim::SimulatedNode;
use myst_session::{
    ConnectTarget, ConnectionStatistic, CoreBinding, SessionConfig, SessionCoordinator,
    SessionEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    info!("myst-vpn starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_file(Path::new(&path))
            .with_context(|| format!("loading config from {}", path))?,
        None => SessionConfig::default(),
    };
    let currency = config.token_currency.clone();

    let binding = CoreBinding::new();
    let session = Arc::new(SessionCoordinator::open(config, binding.clone())?);
    let mut events = session.subscribe();

    let observer = session.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&observer, &event, &currency),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event log lagged by {} events", n)
                }
                Err(_) => break,
            }
        }
    });

    // The node service binds a little after startup
    let node = Arc::new(SimulatedNode::new());
    let late = node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        binding.complete(late);
    });

    let identity = session.start().await?;
    info!("Consumer identity: {}", identity.address);

    node.set_balance(&identity.address, 12.5);
    let balance = session.refresh_balance().await?;
    let rate = session.exchange_rate().await?;
    info!(
        "Balance {} {} (~{:.2} {})",
        balance.amount,
        balance.currency,
        balance.amount * rate,
        session.config().fiat_currency
    );

    let target = ConnectTarget::new("0x7c4f5e2a", "wireguard");
    if session.favourites().toggle(&target)? {
        info!("Added {} to favourites", target);
    }

    node.set_public_ip("203.0.113.7");
    session.connect(target).await?;

    for second in 1..=3u64 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        node.push_statistics(ConnectionStatistic {
            bytes_sent: second * 48_000,
            bytes_received: second * 512_000,
            tokens_spent: second as f64 * 0.0021,
            duration: Duration::from_secs(second),
        });
    }
    node.push_balance(&identity.address, 12.4937);
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.disconnect(true).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.shutdown().await;
    info!("myst-vpn shutting down");
    Ok(())
}

fn log_event(session: &SessionCoordinator, event: &SessionEvent, currency: &str) {
    match event {
        SessionEvent::StatisticsUpdated(stats) => info!("{}", stats.format(currency)),
        SessionEvent::BalanceChanged(snapshot) => {
            info!("Balance: {} {}", snapshot.amount, snapshot.currency)
        }
        SessionEvent::IpChanged(ip) => info!("Public IP: {}", ip),
        other => match session.notice_for(other) {
            Some(notice) => warn!("{:?} -> {:?}", other, notice),
            None => info!("{:?}", other),
        },
    }
}
