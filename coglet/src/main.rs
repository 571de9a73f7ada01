use clap::Parser;
use coglet::transport::{serve, ServerConfig};
use coglet::{Cli, Config, Manager};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(cli, None)?;

    let server_config = ServerConfig {
        host: config.host.clone(),
        port: config.port,
        await_explicit_shutdown: config.await_explicit_shutdown,
    };

    let manager = Manager::new(config);
    manager.start().await?;

    let crash_monitor = manager.clone();
    tokio::spawn(async move { crash_monitor.monitor_crashes().await });

    #[cfg(unix)]
    {
        let signal_watcher = manager.clone();
        tokio::spawn(async move { signal_watcher.watch_legacy_signals().await });
    }

    serve(server_config, manager).await
}
