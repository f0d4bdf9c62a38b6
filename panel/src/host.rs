use std::{
    fs::{self, File},
    io::{self, Read, Write},
    net::{SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::mpsc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use smart_leds::RGB8;
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, info, trace, warn};

use ledpanel_common::{
    api::{error_json, AppointmentBody, BundleBody, DeleteAppointmentBody, UpdateBody},
    load_config, DeviceConfig, FlashError, FlashSink, HttpClient, HttpResponse, NetworkInfo,
    Panel, PanelError, PixelDisplay, Request, Response, UpdateJob, UpdateTarget,
    FIRMWARE_VERSION,
};

use crate::{
    runner::{self, CommandSender, Envelope, PanelLoop, Platform},
    store::{FileStore, CONFIG_FILE},
};

const MAX_REDIRECTS: u32 = 5;

#[derive(Clone)]
struct AppState {
    commands: CommandSender,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("LEDPANEL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.ledpanel"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    info!("ledpanel {FIRMWARE_VERSION}, data in {}", data_dir.display());

    let (commands, receiver) = mpsc::channel();
    let platform = HostPlatform { ip: local_ip() };
    let loop_dir = data_dir.clone();
    runner::spawn(platform, move || {
        let mut store = FileStore::new(loop_dir.join(CONFIG_FILE));
        let config = load_config(&mut store);
        info!("config loaded from {}", store.path().display());
        Ok(PanelLoop {
            panel: Panel::new(config, seed()),
            http: UreqClient,
            flash: FileFlash::new(loop_dir.join("updates")),
            store,
            display: LogDisplay::default(),
            commands: receiver,
        })
    })?;

    let web_root = data_dir.join("www");
    let app = Router::new()
        .route("/api/config", get(handle_get_config).post(handle_post_config))
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/appointments",
            get(handle_get_appointments)
                .post(handle_post_appointment)
                .delete(handle_delete_appointment),
        )
        .route("/api/update", post(handle_update))
        .route("/api/updatefs", post(handle_update_fs))
        .route("/api/update_bundle", post(handle_update_bundle))
        .fallback_service(
            ServeDir::new(&web_root).fallback(ServeFile::new(web_root.join("index.html"))),
        )
        .with_state(AppState { commands });

    let port = std::env::var("LEDPANEL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind panel server at {addr}"))?;

    info!("panel listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_config(State(state): State<AppState>) -> axum::response::Response {
    dispatch(&state, Request::GetConfig).await
}

async fn handle_post_config(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<Value>(&body) {
        Ok(patch) => dispatch(&state, Request::PatchConfig(patch)).await,
        Err(response) => response,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    dispatch(&state, Request::Status).await
}

async fn handle_get_appointments(State(state): State<AppState>) -> axum::response::Response {
    dispatch(&state, Request::ListAppointments).await
}

async fn handle_post_appointment(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<AppointmentBody>(&body) {
        Ok(body) => dispatch(&state, Request::AddAppointment(body)).await,
        Err(response) => response,
    }
}

async fn handle_delete_appointment(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<DeleteAppointmentBody>(&body) {
        Ok(body) => dispatch(&state, Request::DeleteAppointment(body)).await,
        Err(response) => response,
    }
}

async fn handle_update(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<UpdateBody>(&body) {
        Ok(body) => dispatch(&state, Request::Update(UpdateJob::firmware(body))).await,
        Err(response) => response,
    }
}

async fn handle_update_fs(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<UpdateBody>(&body) {
        Ok(body) => dispatch(&state, Request::Update(UpdateJob::filesystem(body))).await,
        Err(response) => response,
    }
}

async fn handle_update_bundle(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    match parse_body::<BundleBody>(&body) {
        Ok(body) => dispatch(&state, Request::Update(UpdateJob::bundle(body))).await,
        Err(response) => response,
    }
}

async fn dispatch(state: &AppState, request: Request) -> axum::response::Response {
    let (reply, response) = oneshot::channel();
    let envelope = Envelope {
        request,
        reply: Box::new(move |response| {
            let _ = reply.send(response);
        }),
    };

    if state.commands.send(envelope).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "panel loop is not running");
    }

    match response.await {
        Ok(response) => json_response(&response),
        Err(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "panel loop dropped the request",
        ),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, axum::response::Response> {
    serde_json::from_slice(body).map_err(|err| {
        debug!("rejecting request body: {err}");
        error_response(StatusCode::BAD_REQUEST, "JSON parse error")
    })
}

fn json_response(response: &Response) -> axum::response::Response {
    let (status, body) = response.to_json();
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(error_json(message))).into_response()
}

struct HostPlatform {
    ip: String,
}

impl Platform for HostPlatform {
    fn local_time(&self, config: &DeviceConfig) -> Option<DateTime<FixedOffset>> {
        Some(config.local_time(Utc::now()))
    }

    fn network(&self) -> NetworkInfo {
        NetworkInfo {
            connected: true,
            ip: self.ip.clone(),
        }
    }

    fn restart(&self) -> ! {
        info!("exiting; the supervisor is expected to start the new image");
        std::process::exit(0)
    }
}

/// Address of the interface that routes outward. Nothing is sent on the socket.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(1)
}

/// Blocking client; redirects are followed by ureq itself.
struct UreqClient;

impl HttpClient for UreqClient {
    type Body = Box<dyn Read + Send + Sync>;

    fn get(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> ledpanel_common::Result<HttpResponse<Self::Body>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .redirects(MAX_REDIRECTS)
            .build();

        match agent.get(url).call() {
            Ok(response) | Err(ureq::Error::Status(_, response)) => {
                Ok(into_http_response(response))
            }
            Err(ureq::Error::Transport(transport)) => Err(transport_error(url, &transport)),
        }
    }
}

fn into_http_response(response: ureq::Response) -> HttpResponse<Box<dyn Read + Send + Sync>> {
    let status = response.status();
    let content_length = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok());
    HttpResponse {
        status,
        content_length,
        body: response.into_reader(),
    }
}

fn transport_error(url: &str, transport: &ureq::Transport) -> PanelError {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|err| {
            matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        });
    if timed_out {
        PanelError::NetworkTimeout(format!("{url}: {transport}"))
    } else {
        PanelError::NetworkUnavailable(format!("{url}: {transport}"))
    }
}

/// Writes update images into the data dir; a finished image replaces the previous one.
struct FileFlash {
    dir: PathBuf,
    active: Option<StagedImage>,
}

struct StagedImage {
    file: File,
    partial: PathBuf,
    target: PathBuf,
}

impl FileFlash {
    fn new(dir: PathBuf) -> Self {
        Self { dir, active: None }
    }

    fn image_path(&self, target: UpdateTarget) -> PathBuf {
        match target {
            UpdateTarget::Firmware => self.dir.join("firmware.bin"),
            UpdateTarget::Filesystem => self.dir.join("filesystem.img"),
        }
    }
}

fn flash_error(action: &str, path: &Path, err: io::Error) -> FlashError {
    FlashError::new(format!("{action} {}: {err}", path.display()))
}

impl FlashSink for FileFlash {
    fn begin(
        &mut self,
        expected_size: Option<u64>,
        target: UpdateTarget,
    ) -> Result<(), FlashError> {
        self.abort();
        fs::create_dir_all(&self.dir).map_err(|err| flash_error("creating", &self.dir, err))?;

        let target = self.image_path(target);
        let partial = target.with_extension("part");
        let file = File::create(&partial).map_err(|err| flash_error("creating", &partial, err))?;
        debug!("staging {} ({expected_size:?} bytes declared)", partial.display());
        self.active = Some(StagedImage {
            file,
            partial,
            target,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let image = self
            .active
            .as_mut()
            .ok_or_else(|| FlashError::new("no update in progress"))?;
        image
            .file
            .write_all(data)
            .map_err(|err| flash_error("writing", &image.partial, err))?;
        Ok(data.len())
    }

    fn end(&mut self) -> Result<(), FlashError> {
        let image = self
            .active
            .take()
            .ok_or_else(|| FlashError::new("no update in progress"))?;
        image
            .file
            .sync_all()
            .map_err(|err| flash_error("syncing", &image.partial, err))?;
        fs::rename(&image.partial, &image.target)
            .map_err(|err| flash_error("activating", &image.target, err))?;
        info!("update image stored at {}", image.target.display());
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(image) = self.active.take() {
            drop(image.file);
            if let Err(err) = fs::remove_file(&image.partial) {
                warn!("failed to remove {}: {err}", image.partial.display());
            }
        }
    }
}

/// Stand-in for the LED strip: logs frames at trace level when they change.
#[derive(Default)]
struct LogDisplay {
    last: Vec<RGB8>,
    brightness: u8,
}

impl PixelDisplay for LogDisplay {
    fn show(&mut self, pixels: &[RGB8], brightness: u8) -> ledpanel_common::Result<()> {
        if pixels == self.last.as_slice() && brightness == self.brightness {
            return Ok(());
        }

        let lit = pixels.iter().filter(|pixel| **pixel != RGB8::default()).count();
        let scaled: Vec<RGB8> =
            smart_leds::brightness(pixels.iter().copied(), brightness).collect();
        trace!(lit, brightness, first = ?scaled.first(), "frame");

        self.last.clear();
        self.last.extend_from_slice(pixels);
        self.brightness = brightness;
        Ok(())
    }
}
