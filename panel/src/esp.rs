use core::convert::TryInto;
use std::{
    ffi::CStr,
    fs::File,
    io::{self, Read as _},
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::{Read as _, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{
        Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy,
    },
    http::server::{self, Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sntp::EspSntp,
    sys::{self, esp, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use ledpanel_common::{
    api::{AppointmentBody, BundleBody, DeleteAppointmentBody, UpdateBody},
    load_config, ConfigStore, DeviceConfig, FlashError, FlashSink, HttpClient, HttpResponse,
    NetworkInfo, Panel, PanelError, Request, Response, UpdateJob, UpdateTarget,
    FIRMWARE_VERSION,
};

use crate::{
    runner::{self, CommandSender, Envelope, PanelLoop, Platform},
    store::{FileStore, CONFIG_FILE},
    ws2812::Ws2812,
};

const SPIFFS_BASE: &CStr = c"/spiffs";
const SPIFFS_ROOT: &str = "/spiffs";
const SPIFFS_MAX_FILES: usize = 8;
const MAX_HTTP_BODY: usize = 16 * 1024;
const FILE_CHUNK: usize = 2048;
const FLASH_SECTOR_SIZE: usize = 4096;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
/// The RTC starts in 1970; anything before this year means SNTP has not synced yet.
const MIN_SYNCED_YEAR: i32 = 2021;

type HttpRequest<'a, 'r> = server::Request<&'a mut server::EspHttpConnection<'r>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("ledpanel {FIRMWARE_VERSION} starting");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    mount_spiffs().context("failed to mount SPIFFS")?;

    let Peripherals {
        modem, rmt, pins, ..
    } = Peripherals::take()?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition).context("wifi startup failed")?;
    let ip = wifi
        .sta_netif()
        .get_ip_info()
        .map(|info| info.ip.to_string())
        .unwrap_or_default();
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let (commands, receiver) = mpsc::channel();
    runner::spawn(DevicePlatform { ip }, move || {
        let display = Ws2812::new(rmt.channel0, pins.gpio5)?;
        let mut store = SpiffsStore::new();
        let config = load_config(&mut store);
        // SAFETY: esp_random has no preconditions.
        let seed = unsafe { sys::esp_random() };
        Ok(PanelLoop {
            panel: Panel::new(config, seed),
            http: EspHttp,
            flash: EspFlash::default(),
            store,
            display,
            commands: receiver,
        })
    })?;

    let server = create_http_server(commands)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

struct DevicePlatform {
    ip: String,
}

impl Platform for DevicePlatform {
    fn local_time(&self, config: &DeviceConfig) -> Option<DateTime<FixedOffset>> {
        let now = Utc::now();
        (now.year() >= MIN_SYNCED_YEAR).then(|| config.local_time(now))
    }

    fn network(&self) -> NetworkInfo {
        NetworkInfo {
            connected: is_wifi_station_connected(),
            ip: self.ip.clone(),
        }
    }

    fn restart(&self) -> ! {
        esp_idf_svc::hal::reset::restart()
    }
}

/// Station mode with compile-time credentials. Without a connection the panel keeps running
/// offline and shows its effect.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.trim().is_empty() {
        warn!("WIFI_SSID not set at build time; running offline");
        return Ok(esp_wifi);
    }

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}")
            }
        }
        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }

    warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; running offline");
    Ok(esp_wifi)
}

fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(0) };
    if rc != sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = sys::wifi_ap_record_t::default();
    let rc = unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == sys::ESP_OK
}

fn mount_spiffs() -> Result<(), EspError> {
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };
    esp!(unsafe { sys::esp_vfs_spiffs_register(&conf) })
}

fn unmount_spiffs() -> Result<(), EspError> {
    esp!(unsafe { sys::esp_vfs_spiffs_unregister(core::ptr::null()) })
}

/// Config file on the SPIFFS partition; remounting picks up a freshly flashed image.
struct SpiffsStore {
    files: FileStore,
}

impl SpiffsStore {
    fn new() -> Self {
        Self {
            files: FileStore::new(format!("{SPIFFS_ROOT}/{CONFIG_FILE}")),
        }
    }
}

impl ConfigStore for SpiffsStore {
    fn load_raw(&mut self) -> ledpanel_common::Result<Option<Vec<u8>>> {
        self.files.load_raw()
    }

    fn save_raw(&mut self, payload: &[u8]) -> ledpanel_common::Result<()> {
        self.files.save_raw(payload)
    }

    fn remount(&mut self) -> ledpanel_common::Result<()> {
        if let Err(err) = unmount_spiffs() {
            warn!("SPIFFS unmount failed: {err}");
        }
        mount_spiffs().map_err(|err| PanelError::Storage(format!("SPIFFS mount failed: {err}")))
    }
}

/// One connection per request; the body owns it until dropped.
struct EspHttp;

struct EspBody(EspHttpConnection);

impl HttpClient for EspHttp {
    type Body = EspBody;

    fn get(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> ledpanel_common::Result<HttpResponse<Self::Body>> {
        let config = HttpClientConfiguration {
            timeout: Some(timeout),
            follow_redirects_policy: FollowRedirectsPolicy::FollowGetHead,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let network_error = |err: EspError| network_error(url, err);

        let mut conn = EspHttpConnection::new(&config).map_err(network_error)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(network_error)?;
        conn.initiate_response().map_err(network_error)?;

        let status = conn.status();
        let content_length = conn
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        Ok(HttpResponse {
            status,
            content_length,
            body: EspBody(conn),
        })
    }
}

impl io::Read for EspBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|err| {
            if is_timeout(&err) {
                io::Error::from(io::ErrorKind::WouldBlock)
            } else {
                io::Error::other(err)
            }
        })
    }
}

fn is_timeout(err: &EspError) -> bool {
    let code = err.code();
    code == sys::ESP_ERR_TIMEOUT as sys::esp_err_t
        || code == sys::ESP_ERR_HTTP_EAGAIN as sys::esp_err_t
}

fn network_error(url: &str, err: EspError) -> PanelError {
    if is_timeout(&err) {
        PanelError::NetworkTimeout(format!("{url}: {err}"))
    } else {
        PanelError::NetworkUnavailable(format!("{url}: {err}"))
    }
}

/// Firmware goes through the OTA API into the next app slot; filesystem images are written
/// raw over the SPIFFS data partition, erasing sector by sector ahead of the write offset.
#[derive(Default)]
struct EspFlash {
    active: Option<ActiveUpdate>,
}

enum ActiveUpdate {
    Firmware {
        handle: sys::esp_ota_handle_t,
        partition: *const sys::esp_partition_t,
    },
    Filesystem {
        partition: *const sys::esp_partition_t,
        size: usize,
        offset: usize,
        erased: usize,
    },
}

fn flash_error(err: EspError) -> FlashError {
    FlashError::new(err.to_string())
}

fn begin_firmware(expected: Option<usize>) -> Result<ActiveUpdate, FlashError> {
    let partition = unsafe { sys::esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return Err(FlashError::new("no OTA app partition available"));
    }

    let image_size = expected.unwrap_or(sys::OTA_SIZE_UNKNOWN as usize);
    let mut handle: sys::esp_ota_handle_t = 0;
    esp!(unsafe { sys::esp_ota_begin(partition, image_size, &mut handle) }).map_err(flash_error)?;
    Ok(ActiveUpdate::Firmware { handle, partition })
}

fn begin_filesystem(expected: Option<usize>) -> Result<ActiveUpdate, FlashError> {
    let partition = unsafe {
        sys::esp_partition_find_first(
            sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
            sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_SPIFFS,
            core::ptr::null(),
        )
    };
    if partition.is_null() {
        return Err(FlashError::new("no SPIFFS data partition found"));
    }

    let size = unsafe { (*partition).size } as usize;
    if let Some(len) = expected.filter(|len| *len > size) {
        return Err(FlashError::new(format!(
            "image of {len} bytes exceeds the {size} byte partition"
        )));
    }
    Ok(ActiveUpdate::Filesystem {
        partition,
        size,
        offset: 0,
        erased: 0,
    })
}

impl FlashSink for EspFlash {
    fn begin(
        &mut self,
        expected_size: Option<u64>,
        target: UpdateTarget,
    ) -> Result<(), FlashError> {
        self.abort();
        let expected = expected_size
            .map(usize::try_from)
            .transpose()
            .map_err(|_| FlashError::new("image size does not fit in flash"))?;

        self.active = Some(match target {
            UpdateTarget::Firmware => begin_firmware(expected)?,
            UpdateTarget::Filesystem => begin_filesystem(expected)?,
        });
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        match self.active.as_mut() {
            None => Err(FlashError::new("no update in progress")),
            Some(ActiveUpdate::Firmware { handle, .. }) => {
                esp!(unsafe { sys::esp_ota_write(*handle, data.as_ptr().cast(), data.len()) })
                    .map_err(flash_error)?;
                Ok(data.len())
            }
            Some(ActiveUpdate::Filesystem {
                partition,
                size,
                offset,
                erased,
            }) => {
                let end = *offset + data.len();
                if end > *size {
                    return Err(FlashError::new(format!(
                        "image exceeds the {size} byte partition"
                    )));
                }
                while *erased < end {
                    esp!(unsafe {
                        sys::esp_partition_erase_range(*partition, *erased, FLASH_SECTOR_SIZE)
                    })
                    .map_err(flash_error)?;
                    *erased += FLASH_SECTOR_SIZE;
                }
                esp!(unsafe {
                    sys::esp_partition_write(*partition, *offset, data.as_ptr().cast(), data.len())
                })
                .map_err(flash_error)?;
                *offset = end;
                Ok(data.len())
            }
        }
    }

    fn end(&mut self) -> Result<(), FlashError> {
        match self.active.take() {
            None => Err(FlashError::new("no update in progress")),
            Some(ActiveUpdate::Firmware { handle, partition }) => {
                esp!(unsafe { sys::esp_ota_end(handle) }).map_err(flash_error)?;
                esp!(unsafe { sys::esp_ota_set_boot_partition(partition) }).map_err(flash_error)?;
                info!("firmware image activated for next boot");
                Ok(())
            }
            Some(ActiveUpdate::Filesystem { offset, .. }) => {
                info!("filesystem image written: {offset} bytes");
                Ok(())
            }
        }
    }

    fn abort(&mut self) {
        match self.active.take() {
            Some(ActiveUpdate::Firmware { handle, .. }) => {
                if let Err(err) = esp!(unsafe { sys::esp_ota_abort(handle) }) {
                    warn!("OTA abort failed: {err}");
                }
            }
            Some(ActiveUpdate::Filesystem { offset, .. }) => {
                warn!("filesystem update aborted after {offset} bytes; partition left partial");
            }
            None => {}
        }
    }
}

fn create_http_server(commands: CommandSender) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    route(&mut server, "/api/config", Method::Get, &commands, |_| {
        Ok(Request::GetConfig)
    })?;
    route(&mut server, "/api/config", Method::Post, &commands, |body| {
        parse_json::<Value>(body).map(Request::PatchConfig)
    })?;
    route(&mut server, "/api/status", Method::Get, &commands, |_| {
        Ok(Request::Status)
    })?;
    route(&mut server, "/api/appointments", Method::Get, &commands, |_| {
        Ok(Request::ListAppointments)
    })?;
    route(&mut server, "/api/appointments", Method::Post, &commands, |body| {
        parse_json::<AppointmentBody>(body).map(Request::AddAppointment)
    })?;
    route(&mut server, "/api/appointments", Method::Delete, &commands, |body| {
        parse_json::<DeleteAppointmentBody>(body).map(Request::DeleteAppointment)
    })?;
    route(&mut server, "/api/update", Method::Post, &commands, |body| {
        parse_json::<UpdateBody>(body).map(|body| Request::Update(UpdateJob::firmware(body)))
    })?;
    route(&mut server, "/api/updatefs", Method::Post, &commands, |body| {
        parse_json::<UpdateBody>(body).map(|body| Request::Update(UpdateJob::filesystem(body)))
    })?;
    route(&mut server, "/api/update_bundle", Method::Post, &commands, |body| {
        parse_json::<BundleBody>(body).map(|body| Request::Update(UpdateJob::bundle(body)))
    })?;

    // Registered last so the API routes above take precedence.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, serve_static)?;

    Ok(server)
}

fn route<F>(
    server: &mut EspHttpServer<'static>,
    uri: &str,
    method: Method,
    commands: &CommandSender,
    parse: F,
) -> anyhow::Result<()>
where
    F: Fn(&[u8]) -> Result<Request, &'static str> + Send + 'static,
{
    let commands = commands.clone();
    server.fn_handler::<anyhow::Error, _>(uri, method, move |mut req| {
        let body = match read_request_body(&mut req) {
            Ok(body) => body,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };
        let request = match parse(&body) {
            Ok(request) => request,
            Err(message) => return write_error(req, 400, message),
        };

        match dispatch(&commands, request) {
            Ok(response) => write_response(req, &response),
            Err(err) => write_error(req, 503, &err.to_string()),
        }
    })?;
    Ok(())
}

fn dispatch(commands: &CommandSender, request: Request) -> anyhow::Result<Response> {
    let (reply, response) = mpsc::channel();
    commands
        .send(Envelope {
            request,
            reply: Box::new(move |response| {
                let _ = reply.send(response);
            }),
        })
        .map_err(|_| anyhow!("panel loop is not running"))?;
    response
        .recv()
        .map_err(|_| anyhow!("panel loop dropped the request"))
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, &'static str> {
    serde_json::from_slice(body).map_err(|_| "JSON parse error")
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| anyhow!("failed reading request body: {err:?}"))?;
    }
    Ok(body)
}

fn write_response(req: HttpRequest<'_, '_>, response: &Response) -> anyhow::Result<()> {
    let (status, payload) = response.to_json();
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ledpanel_common::api::error_json(message))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// Serves the web UI from `www/` on SPIFFS; unknown paths get `index.html`.
fn serve_static(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let path = req.uri().split('?').next().unwrap_or("/").to_string();
    let path = match path.as_str() {
        "/" | "/app" => "/index.html".to_string(),
        _ => path,
    };

    let found = (!path.contains(".."))
        .then(|| open_web_file(&path))
        .flatten()
        .or_else(|| open_web_file("/index.html"));
    let Some((mut file, served)) = found else {
        req.into_response(404, None, &[("Content-Type", "text/plain")])?
            .write_all(b"Not Found")?;
        return Ok(());
    };

    let mut response = req.into_response(200, None, &[("Content-Type", content_type(&served))])?;
    let mut chunk = [0_u8; FILE_CHUNK];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        response.write_all(&chunk[..read])?;
    }
    Ok(())
}

fn open_web_file(path: &str) -> Option<(File, String)> {
    let file = File::open(format!("{SPIFFS_ROOT}/www{path}")).ok()?;
    Some((file, path.to_string()))
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
