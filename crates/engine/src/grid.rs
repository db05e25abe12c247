//! Grid state store: the tile image indices plus the human reservation map.
//!
//! Everything here is plain data. The engine wraps a `TileGrid` in a single
//! mutex, so every mutator below runs as one uninterruptible step.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

/// Index into the palette.
pub type TileState = u8;

/// Largest palette a `TileState` can address.
pub const MAX_PALETTE: usize = TileState::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub column: u32,
    pub row: u32,
}

impl Coord {
    pub const fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.column, self.row)
    }
}

/// A human's claim on one tile, valid only while the tile's lease is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hold {
    pub coord: Coord,
    pub lease: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: TileState,
    /// `true` while the bots own the tile.
    available: bool,
    /// Bumped by every reservation; bots armed under an older lease retire.
    lease: u64,
}

#[derive(Debug)]
pub struct TileGrid {
    columns: u32,
    rows: u32,
    palette_size: usize,
    slots: Vec<Slot>,
}

impl TileGrid {
    pub fn new(
        columns: u32,
        rows: u32,
        palette_size: usize,
        mut seed_state: impl FnMut(Coord) -> TileState,
    ) -> Result<Self> {
        if columns == 0 || rows == 0 {
            return Err(EngineError::Config(format!(
                "grid must be at least 1x1, got {columns}x{rows}"
            )));
        }
        if palette_size == 0 || palette_size > MAX_PALETTE {
            return Err(EngineError::Config(format!(
                "palette size {palette_size} is outside 1..={MAX_PALETTE}"
            )));
        }

        let mut slots = Vec::with_capacity(columns as usize * rows as usize);
        for row in 0..rows {
            for column in 0..columns {
                let state = seed_state(Coord::new(column, row));
                slots.push(Slot {
                    state: (state as usize % palette_size) as TileState,
                    available: true,
                    lease: 0,
                });
            }
        }

        Ok(Self {
            columns,
            rows,
            palette_size,
            slots,
        })
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn palette_size(&self) -> usize {
        self.palette_size
    }

    /// Every coordinate, column by column.
    pub fn coords(&self) -> impl Iterator<Item = Coord> {
        let rows = self.rows;
        (0..self.columns).flat_map(move |column| (0..rows).map(move |row| Coord::new(column, row)))
    }

    fn index(&self, coord: Coord) -> Result<usize> {
        if coord.column >= self.columns || coord.row >= self.rows {
            return Err(EngineError::invalid(coord));
        }
        Ok(coord.row as usize * self.columns as usize + coord.column as usize)
    }

    fn coord_at(&self, index: usize) -> Coord {
        let columns = self.columns as usize;
        Coord::new((index % columns) as u32, (index / columns) as u32)
    }

    pub fn state(&self, coord: Coord) -> Result<TileState> {
        Ok(self.slots[self.index(coord)?].state)
    }

    /// Advances the tile to the next palette entry, wrapping around.
    pub fn toggle(&mut self, coord: Coord) -> Result<TileState> {
        let idx = self.index(coord)?;
        let palette_size = self.palette_size;
        let slot = &mut self.slots[idx];
        slot.state = ((slot.state as usize + 1) % palette_size) as TileState;
        Ok(slot.state)
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            columns: self.columns,
            rows: self.rows,
            states: self.slots.iter().map(|s| s.state).collect(),
        }
    }

    pub fn is_available(&self, coord: Coord) -> Result<bool> {
        Ok(self.slots[self.index(coord)?].available)
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.available).count()
    }

    pub fn lease(&self, coord: Coord) -> Result<u64> {
        Ok(self.slots[self.index(coord)?].lease)
    }

    /// `true` if the tile is still bot-driven under the given lease.
    pub fn holds_lease(&self, coord: Coord, lease: u64) -> Result<bool> {
        let slot = &self.slots[self.index(coord)?];
        Ok(slot.available && slot.lease == lease)
    }

    /// Picks an available tile uniformly at random and hands it to a human.
    pub fn reserve(&mut self, rng: &mut impl Rng) -> Result<Hold> {
        let free: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.available)
            .map(|(idx, _)| idx)
            .collect();
        if free.is_empty() {
            return Err(EngineError::NoTilesAvailable);
        }

        let idx = free[rng.random_range(0..free.len())];
        let coord = self.coord_at(idx);
        let slot = &mut self.slots[idx];
        slot.available = false;
        slot.lease += 1;
        Ok(Hold {
            coord,
            lease: slot.lease,
        })
    }

    /// Hands a tile back to the bots. Returns the lease a new bot should be
    /// armed under, or `None` if `hold` no longer owns the tile.
    pub fn release(&mut self, hold: Hold) -> Result<Option<u64>> {
        let idx = self.index(hold.coord)?;
        let slot = &mut self.slots[idx];
        if slot.available || slot.lease != hold.lease {
            return Ok(None);
        }
        slot.available = true;
        Ok(Some(slot.lease))
    }
}

/// Point-in-time copy of every tile state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub columns: u32,
    pub rows: u32,
    /// Row-major tile states.
    pub states: Vec<TileState>,
}

impl GridSnapshot {
    pub fn get(&self, coord: Coord) -> Option<TileState> {
        if coord.column >= self.columns || coord.row >= self.rows {
            return None;
        }
        self.states
            .get(coord.row as usize * self.columns as usize + coord.column as usize)
            .copied()
    }
}
