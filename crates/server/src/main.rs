use anyhow::Context;
use clap::Parser;
use mosaic_engine::{Engine, Palette};
use mosaic_server::config::{Cli, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;

    let palette = Palette::load_dir(&settings.data_dir, settings.resize)
        .with_context(|| format!("loading palette from {}", settings.data_dir.display()))?;
    let engine = Engine::new(settings.engine.clone(), palette).context("starting engine")?;
    engine.start();

    let info = engine.info();
    info!(
        addr = %settings.addr,
        run_id = %info.run_id,
        columns = info.columns,
        rows = info.rows,
        palette = info.palette_size,
        target = info.target,
        bots = info.bots_enabled,
        "mosaic server listening"
    );
    mosaic_server::serve(settings.addr, engine, settings.options()).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
