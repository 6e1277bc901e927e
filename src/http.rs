//! JSON control plane over HTTP.
//!
//! Every route maps onto one [`RigController`] operation. Successful calls
//! answer `200` with a `status` message plus the operation's payload; failures
//! answer `{"error": "..."}`:
//!
//! | Status | Cause                                                          |
//! |--------|----------------------------------------------------------------|
//! | 400    | bad request body, unknown/unselected/closed port, bad limit kind |
//! | 404    | unknown route                                                  |
//! | 409    | operation not valid in the current session phase              |
//! | 500    | I/O, serial or storage failure                                 |

use crate::controller::RigController;
use crate::error::RigError;
use crate::serial::PortListing;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Serve the control plane on `addr` until `shutdown` resolves.
pub async fn serve<F>(controller: RigController, addr: SocketAddr, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |_conn| {
        let controller = controller.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(controller.clone(), req)))
        }
    });

    let server = Server::try_bind(&addr)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown);

    info!(%addr, "HTTP control plane listening");
    server.await
}

/// Answer one request.
pub async fn handle(controller: RigController, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Control request");

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(respond(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("Failed to read request body: {e}") }),
            ))
        }
    };

    let response = match route(&controller, &method, &path, &body).await {
        Ok(payload) => respond(StatusCode::OK, payload),
        Err(err) => {
            if err.status.is_server_error() {
                warn!(%method, %path, error = %err.message, "Control request failed");
            }
            respond(err.status, json!({ "error": err.message }))
        }
    };
    Ok(response)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(path: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("No route for {path}"),
        }
    }
}

impl From<RigError> for ApiError {
    fn from(err: RigError) -> Self {
        let status = match &err {
            e if e.is_caller_error() => StatusCode::BAD_REQUEST,
            RigError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct PortRequest {
    port: String,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Deserialize)]
struct LimitRequest {
    #[serde(rename = "type")]
    kind: String,
    infusion_limit: Option<u32>,
    time_limit: Option<u64>,
    delay: Option<u64>,
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Deserialize)]
struct DestinationRequest {
    destination: String,
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))
}

fn non_empty(value: &str, what: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::bad_request(format!("{what} cannot be empty")));
    }
    Ok(value.to_string())
}

/// `{"status": status}` merged with the fields of `payload`.
fn ok(status: impl Into<String>, payload: Value) -> Result<Value, ApiError> {
    let mut body = json!({ "status": status.into() });
    if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), payload) {
        body.extend(fields);
    }
    Ok(body)
}

fn respond(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

async fn route(
    controller: &RigController,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Result<Value, ApiError> {
    match (method, path) {
        (&Method::GET, "/") => ok(format!("{} is running", controller.config().application.name), json!({})),
        (&Method::GET, "/home/connection") => ok("Connected", json!({ "connected": true })),

        // Serial
        (&Method::GET, "/serial/comports") => {
            let devices = controller.list_devices()?;
            let ports = PortListing::from_names(devices.iter().map(|d| d.name.clone()).collect());
            ok("Available serial ports", json!({ "ports": ports, "devices": devices }))
        }
        (&Method::POST, "/serial/port") => {
            let request: PortRequest = parse(body)?;
            let port = non_empty(&request.port, "Port")?;
            controller.set_port(&port)?;
            ok(format!("Serial port set to {port}"), json!({ "port": port }))
        }
        (&Method::POST, "/serial/transmission") => {
            controller.open().await?;
            ok("Serial transmission started", json!({}))
        }
        (&Method::POST, "/serial/termination") => {
            controller.close().await;
            ok("Serial transmission terminated", json!({}))
        }
        (&Method::POST, "/serial/command") => {
            let request: CommandRequest = parse(body)?;
            let command = non_empty(&request.command, "Command")?;
            controller.send_command(&command).await?;
            ok(format!("Sent command [{command}]"), json!({}))
        }

        // Program
        (&Method::POST, "/program/limit") => {
            let request: LimitRequest = parse(body)?;
            controller.set_limits(&request.kind, request.infusion_limit, request.time_limit, request.delay)?;
            ok("Limit configuration set", json!({}))
        }
        (&Method::POST, "/program/start") => {
            controller.start().await?;
            ok("Program started", json!({}))
        }
        (&Method::POST, "/program/end") => {
            controller.stop().await?;
            ok("Program ended", json!({}))
        }
        (&Method::POST, "/program/interim") => {
            if controller.is_running() {
                controller.pause()?;
                ok("Program paused", json!({ "state": true }))
            } else {
                controller.resume()?;
                ok("Program resumed", json!({ "state": false }))
            }
        }
        (&Method::POST, "/program/reset") => {
            controller.reset().await;
            ok("Controller reset", json!({}))
        }
        (&Method::GET, "/program/start_time") => {
            ok("Program start time", json!({ "start_time": controller.get_start_time() }))
        }
        (&Method::GET, "/program/end_time") => {
            ok("Program end time", json!({ "end_time": controller.get_end_time() }))
        }
        (&Method::GET, "/program/activity") => {
            let running = controller.is_running();
            ok(
                format!("Program activity status: {running}"),
                json!({ "activity": running, "phase": controller.phase() }),
            )
        }

        // Collected data
        (&Method::GET, "/processor/behavior_data") => {
            ok("Behavior data", json!({ "data": controller.get_events().await }))
        }
        (&Method::GET, "/processor/data") => ok(
            "Behavior and frame data",
            json!({
                "data": controller.get_events().await,
                "frames": controller.get_frames().await,
            }),
        ),
        (&Method::GET, "/processor/arduino_configuration") => ok(
            "Rig configuration",
            json!({ "arduino_configuration": controller.get_configuration().await }),
        ),

        // Files
        (&Method::GET, "/file/filename") => {
            let name = controller.get_filename();
            let status = if name.is_some() { "Filename" } else { "No filename set" };
            ok(status, json!({ "name": name }))
        }
        (&Method::POST, "/file/filename") => {
            let request: NameRequest = parse(body)?;
            controller.set_filename(&non_empty(&request.name, "Filename")?);
            let name = controller.get_filename();
            ok(format!("Filename set to {}", name.as_deref().unwrap_or_default()), json!({ "name": name }))
        }
        (&Method::GET, "/file/destination") => {
            let destination = controller.get_destination();
            let status = if destination.is_some() { "Destination" } else { "No destination set" };
            ok(status, json!({ "destination": destination }))
        }
        (&Method::POST, "/file/destination") => {
            let request: DestinationRequest = parse(body)?;
            let destination = non_empty(&request.destination, "Destination")?;
            controller.set_destination(&destination);
            ok(format!("Destination set to {destination}"), json!({ "destination": destination }))
        }
        (&Method::POST, "/file/create_folder") => {
            let folder = controller.make_destination_folder()?;
            ok(
                format!("Created folder at {}", folder.display()),
                json!({ "folder_path": folder }),
            )
        }

        _ => Err(ApiError::not_found(path)),
    }
}
