//! HTTP front end for the latchkey daemon.
//!
//! Routes:
//!
//! | Method | Path            | Result                                   |
//! |--------|-----------------|------------------------------------------|
//! | GET    | `/health`       | `{"status":"ok"}`                        |
//! | GET    | `/codes`        | store records merged with the lock state |
//! | POST   | `/codes`        | create a code, `201 {slot, code}`        |
//! | DELETE | `/codes/{slot}` | revoke a code now                        |
//! | GET    | `/failed`       | failed activations                       |
//! | GET    | `/jobs`         | pending scheduled actions                |
//!
//! Every error body is `{"error": "..."}`.
//!
//! [`serve`] runs the whole daemon; [`TestServer`] runs the routes alone over
//! a caller-built engine on a random port for integration testing.

use latchkey_core::{
    install_signal_handler, shutdown_requested, Clock, Config, CoreError, DaemonLock,
    LifecycleEngine, Scheduler, SystemClock,
};
use latchkey_device::{DeviceError, HttpGateway};
use latchkey_store::{parse_timestamp, Slot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// How often the serve loop looks up from `recv` to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("another latchkey daemon is using {}", .0.display())]
    AlreadyRunning(PathBuf),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Body of `POST /codes`.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub user: String,
    pub enable_at: String,
    pub expire_at: String,
}

/// A routed response, before it is written to the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    fn ok(body: impl Serialize) -> Self {
        Self::with_status(200, body)
    }

    fn with_status(status: u16, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, &format!("serialization error: {e}")),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &CoreError) -> u16 {
    if err.is_invalid_input() {
        return 400;
    }
    match err {
        CoreError::NoSlotAvailable { .. } => 409,
        CoreError::Device(DeviceError::Unreachable(_) | DeviceError::Protocol(_))
        | CoreError::ActivationUnconfirmed { .. } => 502,
        _ => 500,
    }
}

fn from_core(err: &CoreError) -> ApiResponse {
    let status = status_for(err);
    if err.is_gateway_unreachable() {
        warn!("request failed, lock unreachable: {err}");
    } else if status >= 500 {
        error!("request failed: {err}");
    }
    ApiResponse::error(status, &err.to_string())
}

fn create_code(engine: &LifecycleEngine, body: &[u8]) -> ApiResponse {
    let req: CreateRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => return ApiResponse::error(400, &format!("invalid request body: {e}")),
    };
    let (enable_at, expire_at) = match (
        parse_timestamp(&req.enable_at),
        parse_timestamp(&req.expire_at),
    ) {
        (Ok(enable_at), Ok(expire_at)) => (enable_at, expire_at),
        (Err(e), _) | (_, Err(e)) => return ApiResponse::error(400, &e.to_string()),
    };
    match engine.create_code(&req.user, enable_at, expire_at) {
        Ok(created) => ApiResponse::with_status(201, created),
        Err(e) => from_core(&e),
    }
}

fn delete_code(engine: &LifecycleEngine, raw_slot: &str) -> ApiResponse {
    let slot: Slot = match raw_slot.parse() {
        Ok(slot) => slot,
        Err(e) => return ApiResponse::error(400, &e.to_string()),
    };
    match engine.delete_code(slot) {
        Ok(()) => ApiResponse::ok(json!({ "slot": slot, "deleted": true })),
        Err(e) => from_core(&e),
    }
}

/// Dispatch one request. Pure apart from what the engine does.
pub fn route(engine: &LifecycleEngine, method: &Method, url: &str, body: &[u8]) -> ApiResponse {
    let path = url.split('?').next().unwrap_or(url);
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);

    if let Some(raw_slot) = path.strip_prefix("/codes/") {
        return match method {
            Method::Delete => delete_code(engine, raw_slot),
            _ => ApiResponse::error(405, "method not allowed"),
        };
    }

    match (method, path) {
        (Method::Get, "/health") => ApiResponse::ok(json!({ "status": "ok" })),
        (Method::Get, "/codes") => ApiResponse::ok(engine.list_codes()),
        (Method::Post, "/codes") => create_code(engine, body),
        (Method::Get, "/failed") => ApiResponse::ok(engine.failed_codes()),
        (Method::Get, "/jobs") => ApiResponse::ok(engine.scheduled_actions()),
        (_, "/health" | "/codes" | "/failed" | "/jobs") => {
            ApiResponse::error(405, "method not allowed")
        }
        _ => ApiResponse::error(404, "not found"),
    }
}

fn respond(req: Request, response: &ApiResponse) {
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let body = response.body.to_string();
    if let Err(e) = req.respond(
        Response::from_string(body)
            .with_status_code(StatusCode(response.status))
            .with_header(header),
    ) {
        warn!("failed to write response: {e}");
    }
}

/// Handle a single HTTP request end to end.
pub fn handle_request(engine: &LifecycleEngine, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let mut body = Vec::new();
    if let Err(e) = req.as_reader().read_to_end(&mut body) {
        respond(req, &ApiResponse::error(400, &format!("read error: {e}")));
        return;
    }

    let response = route(engine, &method, &url, &body);
    debug!("{method} {url} -> {}", response.status);
    respond(req, &response);
}

/// Serve requests until `stop` returns true.
pub fn run_server(engine: &LifecycleEngine, server: &Server, stop: &dyn Fn() -> bool) {
    while !stop() {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(engine, request),
            Ok(None) => {}
            Err(e) => {
                error!("accept failed: {e}");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Run the daemon: take the data-directory lock, reconcile the store with
/// the lock, start the timer thread, and serve the API until Ctrl-C.
pub fn serve(config: &Config) -> Result<(), ServerError> {
    let layout = config.layout();
    layout.initialize().map_err(CoreError::from)?;
    let _lock = DaemonLock::try_acquire(&layout.lock_file())?
        .ok_or_else(|| ServerError::AlreadyRunning(layout.root().to_path_buf()))?;

    let gateway = HttpGateway::new(config.device.clone()).map_err(CoreError::from)?;
    let server = bind(&config.listen)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = LifecycleEngine::new(
        &layout,
        Arc::new(gateway),
        Scheduler::new(Arc::clone(&clock)),
        clock,
        config.slot_count,
    );

    let report = engine.reconcile_on_startup()?;
    info!(
        "reconciled store: {} expired, {} caught up, {} re-armed",
        report.expired.len(),
        report.caught_up.len(),
        report.rearmed.len()
    );

    let timer = engine.scheduler().start()?;
    install_signal_handler();
    info!("latchkey listening on http://{}", config.listen);
    info!("data directory: {}", layout.root().display());

    run_server(&engine, &server, &shutdown_requested);

    info!("shutting down");
    timer.shutdown();
    Ok(())
}

/// Serves the routes over a caller-built engine on `127.0.0.1:{random}` in a
/// background thread. Dropping it stops the thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(engine: LifecycleEngine) -> Self {
        let server = Server::http("127.0.0.1:0").expect("failed to bind test HTTP server");
        let port = server
            .server_addr()
            .to_ip()
            .expect("not an IP addr")
            .port();
        let url = format!("http://127.0.0.1:{port}");

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            run_server(&engine, &server, &|| flag.load(Ordering::SeqCst));
        });

        Self {
            url,
            port,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
