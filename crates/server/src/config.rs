//! Process configuration: an optional YAML file as the base layer, with
//! command-line flags and environment variables on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use mosaic_engine::EngineConfig;
use serde::Deserialize;

use crate::ServerOptions;

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "mosaic-server", about = "Serve the Mosaic tile grid over HTTP and WebSockets")]
pub struct Cli {
    /// YAML file with base settings.
    #[arg(long, env = "MOSAIC_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "MOSAIC_ADDR")]
    pub addr: Option<SocketAddr>,

    /// Directory holding the palette images.
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Integer downscale factor applied to every palette image.
    #[arg(long, env = "RESIZE")]
    pub resize: Option<u32>,

    #[arg(long, env = "COLUMNS")]
    pub columns: Option<u32>,

    #[arg(long, env = "ROWS")]
    pub rows: Option<u32>,

    /// Palette index to converge on; negative picks one at random.
    #[arg(long, env = "TARGET", allow_hyphen_values = true)]
    pub target: Option<i64>,

    #[arg(long, env = "BOTS", value_parser = clap::builder::BoolishValueParser::new())]
    pub bots: Option<bool>,

    #[arg(long, env = "MOSAIC_SEED")]
    pub seed: Option<u64>,

    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Allowed CORS origins; empty allows any.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    pub resize: u32,
    pub static_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub engine: EngineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            data_dir: PathBuf::from("data"),
            resize: 1,
            static_dir: None,
            cors_origins: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let base = match &cli.config {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        base.overlay(cli)
    }

    fn overlay(mut self, cli: &Cli) -> anyhow::Result<Self> {
        if let Some(addr) = cli.addr {
            self.addr = addr;
        }
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(resize) = cli.resize {
            self.resize = resize;
        }
        if let Some(dir) = &cli.static_dir {
            self.static_dir = Some(dir.clone());
        }
        if !cli.cors_origins.is_empty() {
            self.cors_origins = cli.cors_origins.clone();
        }
        if let Some(columns) = cli.columns {
            self.engine.columns = columns;
        }
        if let Some(rows) = cli.rows {
            self.engine.rows = rows;
        }
        if let Some(target) = cli.target {
            self.engine.target = match target {
                t if t < 0 => None,
                t => Some(u8::try_from(t).with_context(|| format!("target {t} is out of range"))?),
            };
        }
        if let Some(bots) = cli.bots {
            self.engine.bots_enabled = bots;
        }
        if cli.seed.is_some() {
            self.engine.seed = cli.seed;
        }

        if self.resize == 0 {
            bail!("resize factor must be at least 1");
        }
        Ok(self)
    }

    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            static_dir: self.static_dir.clone(),
            cors_origins: self.cors_origins.clone(),
        }
    }
}
