//! LinkRelay bot binary: Telegram bot plus the status API. Run with --port, or use settings.json.

use std::sync::Arc;

use linkrelay_core::config;
use linkrelay_core::queue::TenantRegistry;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = config::ensure_loaded();
    let mut port = config.status_port;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(config.status_port);
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(port))
}

async fn run(port: u16) -> anyhow::Result<()> {
    let registry = TenantRegistry::new();
    // Telegram bot (long polling); no-op if no bot token is configured
    let bot = linkrelay_server::run_telegram_bot(Arc::clone(&registry));
    linkrelay_server::run_web_server(port, registry, bot)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}
