use std::sync::Arc;

use anyhow::Context;

use tg_relay::app::Relay;
use tg_relay::channels::TelegramMessenger;
use tg_relay::config::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    eprintln!("📡 TG Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Session: {}", config.session_name);
    eprintln!("   Source: {}", config.source);
    eprintln!("   Destination: {}", config.destination);
    eprintln!(
        "   Counterpart: {} (timeout {}s)",
        config.counterpart,
        config.consult_timeout.as_secs()
    );
    eprintln!(
        "   Self-test: {}",
        match (config.self_test.enabled, &config.self_test.identity) {
            (false, _) => "disabled".to_string(),
            (true, Some(identity)) => format!("enabled (@{})", identity.trim_start_matches('@')),
            (true, None) => "enabled, no identity set (will skip)".to_string(),
        }
    );
    if config.counterpart.is_bot_username() {
        eprintln!(
            "   Warning: {} is a bot; the Bot API cannot message other bots, so consultations will fail",
            config.counterpart
        );
    }
    eprintln!("   Press Ctrl+C to stop.\n");

    let messenger = Arc::new(TelegramMessenger::new(
        config.bot_token.clone(),
        config.api_base.clone(),
    ));

    let relay = Relay::start(&config, messenger)
        .await
        .context("relay failed to start")?;

    relay
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl+C received, shutting down...");
        })
        .await?;

    Ok(())
}
