//! HTTP surface: `/api/v1/servers*` and the live-session upgrade at `/`.

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use krypton_datamodel::webserver::{
    CargoShipRequest, CreateServerRequest, CreateServerResponse, ErrorResponse, MessageResponse,
    UpdateServerRequest, UpdateServerResponse,
};
use krypton_datamodel::websocket::PowerAction;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::web::websocket::WebSocket;
use poem::web::{Data, Json, Path, Query, RemoteAddr};
use poem::{get, handler, post, EndpointExt, IntoResponse, Response, Route, Server};
use reqwest::StatusCode;

use self::middleware::api_key::ApiKeyMiddleware;
use crate::error::Error;
use crate::websocket::{self, ConnectParams};
use crate::AppState;

pub mod middleware;

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_client_fault() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(ErrorResponse::new(error))).into_response()
}

#[handler]
async fn create_server(
    Data(state): Data<&Arc<AppState>>,
    Json(req): Json<CreateServerRequest>,
) -> Response {
    let validation_token = req.validation_token.clone();

    match state.servers.create(req).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(CreateServerResponse {
                id: record.id,
                name: record.name,
                state: record.state,
                validation_token,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn list_servers(Data(state): Data<&Arc<AppState>>) -> Response {
    match state.servers.list().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn get_server(Data(state): Data<&Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.servers.get(&id).await {
        Ok(server) => Json(server).into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn update_server(
    Data(state): Data<&Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateServerRequest>,
) -> Response {
    if let Some(body_id) = &req.server_id {
        if body_id != &id {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!(
                    "body server id '{body_id}' does not match the path"
                ))),
            )
                .into_response();
        }
    }

    match state.servers.update(&id, req).await {
        Ok(server) => Json(UpdateServerResponse {
            message: format!("server {id} updated"),
            server,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn delete_server(Data(state): Data<&Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.servers.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn reinstall_server(Data(state): Data<&Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.servers.reinstall(&id).await {
        Ok(()) => Json(MessageResponse::new(format!("reinstalling server {id}"))).into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn ship_cargo(
    Data(state): Data<&Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CargoShipRequest>,
) -> Response {
    let count = req.cargo.len();
    match state.servers.ship_cargo(&id, req.cargo).await {
        Ok(()) => Json(MessageResponse::new(format!(
            "shipped {count} cargo file(s) to server {id}"
        )))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn power_server(
    Data(state): Data<&Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    let Ok(action) = PowerAction::from_str(&action) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("unknown power action '{action}'"))),
        )
            .into_response();
    };

    match state.servers.power(&id, action).await {
        Ok(new_state) => Json(MessageResponse::new(format!(
            "server {id} is now {new_state}"
        )))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[handler]
async fn live_session(
    Data(state): Data<&Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    remote: &RemoteAddr,
    ws: WebSocket,
) -> impl IntoResponse {
    let state = Arc::clone(state);
    let peer = remote.as_socket_addr().map(|addr| addr.ip());

    ws.on_upgrade(move |socket| websocket::run_session(state, socket, params, peer))
}

pub async fn serve(state: Arc<AppState>) -> io::Result<()> {
    let host = state.config.api.host;
    let port = state.config.api.port;

    let servers_api = Route::new()
        .at("/servers", post(create_server).get(list_servers))
        .at(
            "/servers/:id",
            get(get_server).patch(update_server).delete(delete_server),
        )
        .at("/servers/:id/reinstall", post(reinstall_server))
        .at("/servers/:id/cargo/ship", post(ship_cargo))
        .at("/servers/:id/power/:action", post(power_server))
        .with(ApiKeyMiddleware::new(state.config.api.key.clone()));

    let app = Route::new()
        .at("/", get(live_session))
        .nest("/api/v1", servers_api)
        .with(middleware::tracing::Tracing)
        .with(Cors::new())
        .data(state);

    Server::new(TcpListener::bind((host, port))).run(app).await
}
