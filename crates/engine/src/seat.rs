use tracing::{debug, warn};

use crate::error::Result;
use crate::grid::{Coord, Hold, TileState};
use crate::Engine;

/// A connected human's hold on one tile.
///
/// The tile goes back to the bots when the seat is dropped, however the
/// connection ended.
#[derive(Debug)]
pub struct Seat {
    engine: Engine,
    hold: Hold,
}

impl Seat {
    pub(crate) fn claim(engine: Engine) -> Result<Self> {
        let hold = engine.reserve()?;
        Ok(Self { engine, hold })
    }

    pub fn coord(&self) -> Coord {
        self.hold.coord
    }

    pub fn hold(&self) -> Hold {
        self.hold
    }

    pub fn toggle(&self) -> Result<TileState> {
        self.engine.toggle(&self.engine.run_id(), self.hold.coord)
    }

    /// Gives the current tile back and takes another (possibly the same one
    /// if nothing else is free).
    pub fn change_tile(&mut self) -> Result<Hold> {
        self.hold = self.engine.reassign(Some(self.hold))?;
        Ok(self.hold)
    }
}

impl Drop for Seat {
    fn drop(&mut self) {
        match self.engine.release(self.hold) {
            Ok(true) => {}
            Ok(false) => debug!(coord = %self.hold.coord, "seat tile already handed on"),
            Err(err) => warn!(coord = %self.hold.coord, %err, "could not release seat"),
        }
    }
}
