use crate::grid::Coord;

/// Errors surfaced by engine operations.
///
/// None of these are fatal to a running engine; only `Config` and `Palette`
/// abort startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("tile {column}/{row} is outside the grid")]
    InvalidCoordinate { column: u32, row: u32 },
    #[error("run id does not match the current run")]
    StaleRun,
    #[error("every tile is currently held by a human")]
    NoTilesAvailable,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("palette error: {0}")]
    Palette(String),
}

impl EngineError {
    pub(crate) fn invalid(coord: Coord) -> Self {
        Self::InvalidCoordinate {
            column: coord.column,
            row: coord.row,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
