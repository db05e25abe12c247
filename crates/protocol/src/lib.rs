use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One tile pushed to a viewer. `image` is a base64 PNG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileUpdate {
    pub column: u32,
    pub row: u32,
    pub state: u8,
    pub image: String,
}

/// The tile a human was given, and the run it belongs to. `lease` must be
/// presented when giving the tile back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileAssignment {
    pub column: u32,
    pub row: u32,
    pub lease: u64,
    pub run_id: String,
}

/// Text commands accepted on the interactive client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Toggle,
    ChangeTile,
}

impl ClientCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toggle => "toggle",
            Self::ChangeTile => "change-tile",
        }
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "toggle" => Ok(Self::Toggle),
            "change-tile" => Ok(Self::ChangeTile),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command {:?}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidCoordinate,
    StaleRun,
    NoTilesAvailable,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub mod routes {
    pub const HOME: &str = "/";
    pub const CLIENT: &str = "/client";
    pub const HEALTH: &str = "/health";
    pub const INFO: &str = "/api/info";
    pub const GRID: &str = "/api/grid";
    pub const TILE_ASSIGNMENT: &str = "/api/tile-assignment";
    pub const TOGGLE: &str = "/api/image/column/{column}/row/{row}/state/toggle";
    pub const TILE_IMAGE: &str = "/api/image/column/{column}/row/{row}";
    pub const FULL_IMAGE: &str = "/api/image/full";
    pub const SUBSCRIBE: &str = "/ws";
    pub const CLIENT_SOCKET: &str = "/ws-client";
    pub const STATIC: &str = "/static";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_socket_text() {
        assert_eq!("toggle".parse(), Ok(ClientCommand::Toggle));
        assert_eq!("change-tile\n".parse(), Ok(ClientCommand::ChangeTile));
        assert_eq!(
            "flip".parse::<ClientCommand>(),
            Err(UnknownCommand("flip".into()))
        );
        assert_eq!(ClientCommand::ChangeTile.to_string(), "change-tile");
    }

    #[test]
    fn error_codes_are_snake_case() {
        let body = ApiError::new(ErrorCode::NoTilesAvailable, "full");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "no_tiles_available");
    }
}
