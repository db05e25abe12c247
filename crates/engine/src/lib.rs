//! Tile grid engine for Mosaic.
//!
//! A target picture hides behind a grid of tiles. Each tile cycles through a
//! palette of images when toggled, by a human holding the tile or by a bot.
//! [`Engine`] owns the grid, the reservations, the bots and the change feed;
//! clone it freely, every clone is the same engine.

pub mod bots;
pub mod config;
pub mod error;
pub mod feed;
pub mod grid;
pub mod palette;
pub mod seat;
pub mod subscriber;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use bots::{BotTurn, DelayPolicy, Inertia};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use feed::{ChangeFeed, Pending, Subscription};
pub use grid::{Coord, GridSnapshot, Hold, TileGrid, TileState};
pub use palette::{encode_png, Palette};
pub use seat::Seat;
pub use subscriber::{stream_changes, CloseReason, Liveness, StreamReport, SubscriberDisconnected, TileSink};

/// Identifies one process incarnation. Clients holding an older one are
/// turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Anything that does not parse cannot be the current run.
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| EngineError::StaleRun)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub started_at: String,
    pub columns: u32,
    pub rows: u32,
    pub palette_size: usize,
    pub target: TileState,
    pub bots_enabled: bool,
    pub inertia: f64,
}

/// One tile, ready to push to a viewer.
#[derive(Debug, Clone)]
pub struct RenderedTile {
    pub coord: Coord,
    pub state: TileState,
    pub png: Vec<u8>,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) palette: Palette,
    pub(crate) target: TileState,
    pub(crate) run_id: RunId,
    pub(crate) started_at: OffsetDateTime,
    pub(crate) grid: Mutex<TileGrid>,
    pub(crate) feed: ChangeFeed,
    pub(crate) inertia: Inertia,
    pub(crate) delays: DelayPolicy,
    rng: Mutex<StdRng>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn lock_grid(&self) -> MutexGuard<'_, TileGrid> {
        self.grid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("run_id", &self.shared.run_id)
            .field("columns", &self.shared.config.columns)
            .field("rows", &self.shared.config.rows)
            .field("target", &self.shared.target)
            .finish()
    }
}

impl Engine {
    /// Builds the grid with every tile on a random palette entry and every
    /// tile owned by the bots. Does not start any task; see [`Engine::start`].
    pub fn new(config: EngineConfig, palette: Palette) -> Result<Self> {
        config.validate()?;
        if palette.is_empty() {
            return Err(EngineError::Palette("palette is empty".into()));
        }
        palette.check_grid(config.columns, config.rows)?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let palette_size = palette.len();
        let target = match config.target {
            Some(t) if (t as usize) < palette_size => t,
            Some(t) => {
                return Err(EngineError::Config(format!(
                    "target {t} is outside a palette of {palette_size}"
                )))
            }
            None => rng.random_range(0..palette_size) as TileState,
        };

        let grid = TileGrid::new(config.columns, config.rows, palette_size, |_| {
            rng.random_range(0..palette_size) as TileState
        })?;

        let inertia = Inertia::new(
            config.inertia.initial,
            config.inertia.floor,
            config.inertia.step,
        );
        let delays = DelayPolicy::new(config.bots.clone());
        let (shutdown, _) = watch::channel(false);
        let run_id = RunId::new();

        info!(
            %run_id,
            columns = config.columns,
            rows = config.rows,
            palette = palette_size,
            target,
            "engine initialised"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                palette,
                target,
                run_id,
                started_at: OffsetDateTime::now_utc(),
                grid: Mutex::new(grid),
                feed: ChangeFeed::new(),
                inertia,
                delays,
                rng: Mutex::new(rng),
                started: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    /// Starts the inertia decay and, if enabled, one bot per unreserved tile.
    /// Only the first call does anything.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            warn!("engine already started");
            return;
        }
        self.spawn_inertia_decay();
        if !self.shared.config.bots_enabled {
            return;
        }

        let bots: Vec<(Coord, u64)> = {
            let grid = self.shared.lock_grid();
            grid.coords()
                .filter_map(|c| match (grid.is_available(c), grid.lease(c)) {
                    (Ok(true), Ok(lease)) => Some((c, lease)),
                    _ => None,
                })
                .collect()
        };
        info!(count = bots.len(), "starting bots");
        for (coord, lease) in bots {
            self.arm_bot(coord, lease);
        }
    }

    /// Stops bots and the decay driver and ends every subscriber stream.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.feed.close();
    }

    /// Resolves once [`Engine::shutdown`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn columns(&self) -> u32 {
        self.shared.config.columns
    }

    pub fn rows(&self) -> u32 {
        self.shared.config.rows
    }

    pub fn target(&self) -> TileState {
        self.shared.target
    }

    pub fn palette_size(&self) -> usize {
        self.shared.palette.len()
    }

    pub fn inertia(&self) -> f64 {
        self.shared.inertia.current()
    }

    pub fn info(&self) -> RunInfo {
        let shared = &self.shared;
        RunInfo {
            run_id: shared.run_id,
            started_at: shared
                .started_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| shared.started_at.to_string()),
            columns: shared.config.columns,
            rows: shared.config.rows,
            palette_size: shared.palette.len(),
            target: shared.target,
            bots_enabled: shared.config.bots_enabled,
            inertia: shared.inertia.current(),
        }
    }

    pub fn check_run(&self, run_id: &RunId) -> Result<()> {
        if *run_id != self.shared.run_id {
            return Err(EngineError::StaleRun);
        }
        Ok(())
    }

    /// Advances a tile to its next image and announces the change.
    pub fn toggle(&self, run_id: &RunId, coord: Coord) -> Result<TileState> {
        self.check_run(run_id)?;
        let mut grid = self.shared.lock_grid();
        self.toggle_locked(&mut grid, coord)
    }

    /// The only path that mutates a tile state: the change is published
    /// while the grid lock is still held.
    pub(crate) fn toggle_locked(&self, grid: &mut TileGrid, coord: Coord) -> Result<TileState> {
        let state = grid.toggle(coord)?;
        let reached = self.shared.feed.publish(coord);
        debug!(column = coord.column, row = coord.row, state, reached, "tile toggled");
        Ok(state)
    }

    pub fn tile_state(&self, coord: Coord) -> Result<TileState> {
        self.shared.lock_grid().state(coord)
    }

    pub fn snapshot(&self) -> GridSnapshot {
        self.shared.lock_grid().snapshot()
    }

    pub fn is_reserved(&self, coord: Coord) -> Result<bool> {
        Ok(!self.shared.lock_grid().is_available(coord)?)
    }

    pub fn available_tiles(&self) -> usize {
        self.shared.lock_grid().available_count()
    }

    /// Hands a random bot-driven tile to a human.
    pub fn reserve(&self) -> Result<Hold> {
        let mut grid = self.shared.lock_grid();
        let hold = grid.reserve(&mut *self.shared.lock_rng())?;
        info!(coord = %hold.coord, lease = hold.lease, "assigned tile to human");
        Ok(hold)
    }

    /// Returns a human-held tile to the bots. `false` if `hold` no longer
    /// owns the tile.
    pub fn release(&self, hold: Hold) -> Result<bool> {
        let lease = self.shared.lock_grid().release(hold)?;
        Ok(self.after_release(hold.coord, lease))
    }

    /// Releases `previous` (if it still owns its tile) and reserves a tile in
    /// one step. The released tile is itself a candidate.
    pub fn reassign(&self, previous: Option<Hold>) -> Result<Hold> {
        let (released, hold) = {
            let mut grid = self.shared.lock_grid();
            let released = match previous {
                Some(prev) => grid.release(prev)?.map(|lease| (prev.coord, lease)),
                None => None,
            };
            if let (Some(prev), None) = (previous, released) {
                debug!(coord = %prev.coord, lease = prev.lease, "stale hold not released");
            }
            let hold = grid.reserve(&mut *self.shared.lock_rng())?;
            (released, hold)
        };

        if let Some((prev, lease)) = released {
            if prev != hold.coord {
                self.after_release(prev, Some(lease));
            }
        }
        info!(coord = %hold.coord, lease = hold.lease, "assigned tile to human");
        Ok(hold)
    }

    fn after_release(&self, coord: Coord, lease: Option<u64>) -> bool {
        let Some(lease) = lease else {
            return false;
        };
        if self.shared.config.bots_enabled {
            self.arm_bot(coord, lease);
            info!(column = coord.column, row = coord.row, "replaced human with bot");
        } else {
            info!(column = coord.column, row = coord.row, "released tile");
        }
        true
    }

    /// Claims a tile for a connected human; the tile goes back to the bots
    /// when the seat is dropped.
    pub fn seat(&self) -> Result<Seat> {
        Seat::claim(self.clone())
    }

    /// Attaches a subscriber. Its queue starts with one change for every
    /// tile, so the first thing it renders is the whole grid.
    pub fn subscribe(&self) -> Subscription<'_> {
        let coords: Vec<Coord> = self.shared.lock_grid().coords().collect();
        let sub = self.shared.feed.subscribe(coords);
        info!(subscriber = sub.id(), catch_up = sub.backlog(), "subscriber attached");
        sub
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.feed.subscriber_count()
    }

    pub fn render_tile(&self, coord: Coord) -> Result<RenderedTile> {
        let state = self.tile_state(coord)?;
        let shared = &self.shared;
        let tile = shared
            .palette
            .tile(state, coord, shared.config.columns, shared.config.rows);
        Ok(RenderedTile {
            coord,
            state,
            png: encode_png(&tile)?,
        })
    }

    pub fn render_full(&self) -> Result<Vec<u8>> {
        let snapshot = self.snapshot();
        encode_png(&self.shared.palette.composite(&snapshot))
    }

    pub(crate) fn random_unit(&self) -> f64 {
        self.shared.lock_rng().random::<f64>()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn engine_with(config: EngineConfig, palette_size: usize) -> Engine {
        let palette = palette::solid_palette(palette_size, 8, 8);
        Engine::new(config, palette).unwrap()
    }

    pub fn small_engine(columns: u32, rows: u32, palette_size: usize) -> Engine {
        let config = EngineConfig {
            columns,
            rows,
            target: Some(1),
            bots_enabled: false,
            seed: Some(42),
            ..EngineConfig::default()
        };
        engine_with(config, palette_size)
    }

    /// Toggles until `coord` shows `state`.
    pub fn toggle_to(engine: &Engine, coord: Coord, state: TileState) {
        let run = engine.run_id();
        while engine.tile_state(coord).unwrap() != state {
            engine.toggle(&run, coord).unwrap();
        }
    }
}
