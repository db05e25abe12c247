use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mosaic_engine::{
    stream_changes, Engine, Hold, Liveness, RenderedTile, SubscriberDisconnected, TileSink,
};
use mosaic_protocol::{ApiError, ClientCommand, ErrorCode, TileUpdate};
use tracing::{error, info, warn};

use crate::{assignment, AppState};

pub(crate) async fn subscribe(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| viewer_socket(socket, engine))
}

pub(crate) async fn client(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| client_socket(socket, engine))
}

async fn viewer_socket(socket: WebSocket, engine: Engine) {
    info!("viewer connected");
    let mut sink = ViewerSink { socket };
    let report = stream_changes(&engine, &mut sink).await;
    info!(
        delivered = report.delivered,
        reason = ?report.reason,
        "viewer disconnected"
    );
}

/// Pushes tiles as JSON text frames.
struct ViewerSink {
    socket: WebSocket,
}

impl TileSink for ViewerSink {
    async fn push(&mut self, tile: &RenderedTile) -> Result<(), SubscriberDisconnected> {
        let update = TileUpdate {
            column: tile.coord.column,
            row: tile.coord.row,
            state: tile.state,
            image: STANDARD.encode(&tile.png),
        };
        // Dropping the socket requeues the tile for the other viewers.
        let payload = serde_json::to_string(&update).map_err(|err| {
            error!(%err, "could not encode tile update");
            SubscriberDisconnected
        })?;
        self.socket
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| SubscriberDisconnected)
    }

    async fn probe(&mut self, wait: Duration) -> Liveness {
        match tokio::time::timeout(wait, self.socket.recv()).await {
            Err(_) => Liveness::Alive,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => Liveness::Gone,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => Liveness::Alive,
            Ok(Some(Ok(_))) => {
                warn!("unexpectedly received something on viewer socket");
                Liveness::Alive
            }
        }
    }
}

/// A human at the controls: one seat for the life of the connection.
async fn client_socket(mut socket: WebSocket, engine: Engine) {
    let mut seat = match engine.seat() {
        Ok(seat) => seat,
        Err(err) => {
            warn!(%err, "no tile for client");
            let body = ApiError::new(ErrorCode::NoTilesAvailable, err.to_string());
            if let Ok(payload) = serde_json::to_string(&body) {
                let _ = socket.send(Message::Text(payload.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(coord = %seat.coord(), "client connected");

    if send_assignment(&mut socket, &engine, seat.hold()).await.is_err() {
        return;
    }

    loop {
        let incoming = tokio::select! {
            incoming = socket.recv() => incoming,
            _ = engine.closed() => break,
        };
        let text = match incoming {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        match text.as_str().parse::<ClientCommand>() {
            Ok(ClientCommand::Toggle) => {
                if let Err(err) = seat.toggle() {
                    warn!(coord = %seat.coord(), %err, "client toggle failed");
                }
            }
            Ok(ClientCommand::ChangeTile) => {
                info!(coord = %seat.coord(), "client requested new tile");
                match seat.change_tile() {
                    Ok(hold) => {
                        if send_assignment(&mut socket, &engine, hold).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "could not change tile"),
                }
            }
            Err(unknown) => warn!(%unknown, "ignoring client command"),
        }
    }

    info!(coord = %seat.coord(), "client disconnected");
}

async fn send_assignment(
    socket: &mut WebSocket,
    engine: &Engine,
    hold: Hold,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(&assignment(engine, hold)).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}
