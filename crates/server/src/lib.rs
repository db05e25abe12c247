use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use mosaic_engine::{Coord, Engine, EngineError, GridSnapshot, Hold, RunId, RunInfo, TileState};
use mosaic_protocol::{routes, ApiError, ErrorCode, TileAssignment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

pub mod config;
mod pages;
mod ws;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Router knobs that are not engine state.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub static_dir: Option<PathBuf>,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn build_router(state: AppState, options: &ServerOptions) -> Router {
    let api = Router::new()
        .route(routes::INFO, get(info))
        .route(routes::GRID, get(grid))
        .route(routes::TILE_ASSIGNMENT, get(tile_assignment))
        .route(routes::TOGGLE, put(toggle))
        .route(routes::TILE_IMAGE, get(tile_image))
        .route(routes::FULL_IMAGE, get(full_image))
        // Tiles change constantly; never let a browser reuse one.
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let mut router = Router::new()
        .route(routes::HOME, get(home))
        .route(routes::CLIENT, get(client_page))
        .route(routes::HEALTH, get(health))
        .route(routes::SUBSCRIBE, get(ws::subscribe))
        .route(routes::CLIENT_SOCKET, get(ws::client))
        .merge(api);

    if let Some(dir) = &options.static_dir {
        router = router.nest_service(routes::STATIC, ServeDir::new(dir));
    }

    router.with_state(Arc::new(state)).layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn(log_request))
            .layer(cors_layer(&options.cors_origins)),
    )
}

async fn health() -> &'static str {
    "ok"
}

async fn home(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(pages::viewer(&state.engine))
}

async fn client_page(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(pages::client(&state.engine))
}

async fn info(State(state): State<Arc<AppState>>) -> Json<RunInfo> {
    Json(state.engine.info())
}

async fn grid(State(state): State<Arc<AppState>>) -> Json<GridSnapshot> {
    Json(state.engine.snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AssignmentQuery {
    #[serde(default)]
    run_id: Option<String>,
    /// Tile to give back in the same step, if the caller holds one.
    #[serde(default)]
    column: Option<u32>,
    #[serde(default)]
    row: Option<u32>,
    #[serde(default)]
    lease: Option<u64>,
}

async fn tile_assignment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssignmentQuery>,
) -> ApiResult<Json<TileAssignment>> {
    let engine = &state.engine;
    let previous = match (query.column, query.row, query.lease) {
        (Some(column), Some(row), Some(lease)) => {
            let run = require_run(query.run_id.as_deref())?;
            engine.check_run(&run).map_err(api_error)?;
            Some(Hold {
                coord: Coord::new(column, row),
                lease,
            })
        }
        (None, None, None) => None,
        _ => {
            return Err(bad_request("column, row and lease must be given together"));
        }
    };

    let hold = engine.reassign(previous).map_err(api_error)?;
    Ok(Json(assignment(engine, hold)))
}

async fn toggle(
    State(state): State<Arc<AppState>>,
    Path((column, row)): Path<(u32, u32)>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<TileState>> {
    let run = require_run(query.run_id.as_deref())?;
    let state = state
        .engine
        .toggle(&run, Coord::new(column, row))
        .map_err(api_error)?;
    Ok(Json(state))
}

async fn tile_image(
    State(state): State<Arc<AppState>>,
    Path((column, row)): Path<(u32, u32)>,
) -> ApiResult<Response> {
    let engine = state.engine.clone();
    let tile = tokio::task::spawn_blocking(move || engine.render_tile(Coord::new(column, row)))
        .await
        .map_err(internal)?
        .map_err(api_error)?;
    Ok(png_response(tile.png))
}

async fn full_image(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let engine = state.engine.clone();
    let png = tokio::task::spawn_blocking(move || engine.render_full())
        .await
        .map_err(internal)?
        .map_err(api_error)?;
    Ok(png_response(png))
}

fn png_response(png: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], png).into_response()
}

pub(crate) fn assignment(engine: &Engine, hold: Hold) -> TileAssignment {
    TileAssignment {
        column: hold.coord.column,
        row: hold.coord.row,
        lease: hold.lease,
        run_id: engine.run_id().to_string(),
    }
}

fn require_run(raw: Option<&str>) -> ApiResult<RunId> {
    let Some(raw) = raw else {
        return Err(bad_request("run_id is required"));
    };
    RunId::parse(raw).map_err(api_error)
}

pub(crate) fn api_error(err: EngineError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &err {
        EngineError::InvalidCoordinate { .. } => (StatusCode::NOT_FOUND, ErrorCode::InvalidCoordinate),
        EngineError::StaleRun => (StatusCode::CONFLICT, ErrorCode::StaleRun),
        EngineError::NoTilesAvailable => {
            (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::NoTilesAvailable)
        }
        EngineError::Config(_) | EngineError::Palette(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal)
        }
    };
    (status, Json(ApiError::new(code, err.to_string())))
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::BadRequest, message)),
    )
}

fn internal(err: tokio::task::JoinError) -> (StatusCode, Json<ApiError>) {
    warn!(%err, "render task failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, "render failed")),
    )
}

pub async fn serve(addr: SocketAddr, engine: Engine, options: ServerOptions) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, engine, options, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;
    Ok(())
}

/// Serves until `shutdown` resolves, then stops the engine's bots and ends
/// every open socket.
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    engine: Engine,
    options: ServerOptions,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(
        AppState {
            engine: engine.clone(),
        },
        &options,
    );
    let addr = listener.local_addr()?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        engine.shutdown();
    })
    .await?;
    Ok(addr)
}

async fn log_request(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let response = next.run(req).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        ?peer,
        elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1_000.0),
        "request handled"
    );
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
