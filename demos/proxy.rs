use std::error::Error;

use dhruva::config::DhruvaConfig;
use dhruva::Engine;
use tracing::Level;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dhruva=debug,proxy=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            String::from("%H:%M:%S%.3f"),
        ))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => DhruvaConfig::load(path)?,
        None => DhruvaConfig::default(),
    };

    let engine = Engine::builder(config).build()?;
    engine.start().await?;
    for lp in engine.local_points().iter() {
        log::info!("{} {} on {}:{}", lp.name, lp.transport, lp.host, lp.port);
    }

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;

    Ok(())
}
