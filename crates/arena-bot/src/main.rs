//! Reference agent for the Arena trainer.
//!
//! Listens for the trainer, answers the handshake, and replies to every
//! perception with an input. Used for manual end-to-end runs:
//!
//! ```text
//! BOT_LISTEN=127.0.0.1:9000 arena-bot &
//! BOT_LISTEN=127.0.0.1:9001 arena-bot &
//! ARENA_AGENTS=127.0.0.1:9000,127.0.0.1:9001 arena-trainer
//! ```

mod agent;
mod config;
mod error;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = BotConfig::from_env().context("loading configuration")?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        listen = %config.listen,
        name = %config.name,
        delay_ms = config.delay.as_millis(),
        "arena-bot waiting for the trainer"
    );

    loop {
        let (stream, peer) = listener.accept().await.context("accepting trainer")?;
        stream.set_nodelay(true).context("configuring trainer socket")?;
        info!(%peer, "Trainer connected");

        match agent::play(stream, &config).await {
            Ok(summary) => info!(
                session = ?summary.session,
                agent = ?summary.agent,
                inputs = summary.inputs_sent,
                last_tick = ?summary.last_tick,
                goodbye = summary.goodbye.as_deref().unwrap_or("none"),
                "Session finished"
            ),
            Err(e) => warn!(error = %e, "Session ended with an error"),
        }

        if !config.serve_forever {
            return Ok(());
        }
    }
}
