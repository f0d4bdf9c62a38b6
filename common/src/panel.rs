use chrono::{DateTime, FixedOffset, NaiveDateTime};
use log::{info, warn};
use serde_json::Value;

use crate::{
    api::{Request, Response, UpdateJob},
    calendar::CalendarCache,
    config::{save_config, DeviceConfig, FIRMWARE_VERSION},
    error::{PanelError, Result},
    events::{evaluate, ManualAppointment},
    io::{Clock, ConfigStore, FlashSink, HttpClient, PixelDisplay},
    ota::{UpdateProgress, UpdateReport, UpdateSettings, Updater},
    render::{Frame, RenderState, Renderer},
    types::{CalendarStatus, PanelStatus},
};

pub const SAVE_DEBOUNCE_MS: u64 = 1_000;
pub const TICK_INTERVAL_MS: u64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub connected: bool,
    pub ip: String,
}

/// Borrowed collaborators for one loop iteration or command.
pub struct Devices<'a, H, F, C, S, D> {
    pub http: &'a mut H,
    pub flash: &'a mut F,
    pub clock: &'a C,
    pub store: &'a mut S,
    pub display: &'a mut D,
}

/// Single owner of the device configuration and everything derived from it.
#[derive(Debug)]
pub struct Panel {
    config: DeviceConfig,
    calendars: CalendarCache,
    renderer: Renderer,
    update_settings: UpdateSettings,
    save_due_ms: Option<u64>,
}

impl Panel {
    pub fn new(config: DeviceConfig, seed: u32) -> Self {
        let renderer = Renderer::new(config.led_count, seed);
        Self {
            config,
            calendars: CalendarCache::default(),
            renderer,
            update_settings: UpdateSettings::default(),
            save_due_ms: None,
        }
    }

    pub fn with_update_settings(mut self, settings: UpdateSettings) -> Self {
        self.update_settings = settings;
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn calendars(&self) -> &CalendarCache {
        &self.calendars
    }

    pub fn save_pending(&self) -> bool {
        self.save_due_ms.is_some()
    }

    /// Replaces the config with `patch` merged over it; calendar caches start over.
    pub fn apply_config_patch(&mut self, patch: &Value, now_ms: u64) -> Result<()> {
        let merged = self.config.merged_with(patch)?;
        self.config = merged;
        self.calendars.reset();
        self.renderer.resize(self.config.led_count);
        self.mark_dirty(now_ms);
        info!("configuration updated");
        Ok(())
    }

    pub fn add_appointment(&mut self, time: &str, color: &str, now_ms: u64) -> Result<()> {
        let added = self.config.appointments.add(time, color)?;
        info!("appointment added at {} ({})", added.time, added.color);
        self.mark_dirty(now_ms);
        Ok(())
    }

    pub fn remove_appointment(&mut self, index: i64, now_ms: u64) -> Result<ManualAppointment> {
        let index = usize::try_from(index)
            .map_err(|_| PanelError::invalid(format!("invalid index {index}")))?;
        let removed = self.config.appointments.remove(index)?;
        info!("appointment {index} removed ({})", removed.time);
        self.mark_dirty(now_ms);
        Ok(removed)
    }

    pub fn appointments(&self) -> &[ManualAppointment] {
        self.config.appointments.entries()
    }

    fn mark_dirty(&mut self, now_ms: u64) {
        self.save_due_ms = Some(now_ms + SAVE_DEBOUNCE_MS);
    }

    /// Writes the config once the debounce window has passed. Failures are logged only.
    pub fn save_if_due<S: ConfigStore>(&mut self, store: &mut S, now_ms: u64) {
        if self.save_due_ms.is_some_and(|due| now_ms >= due) {
            self.flush_save(store);
        }
    }

    pub fn flush_save<S: ConfigStore>(&mut self, store: &mut S) {
        if self.save_due_ms.take().is_none() {
            return;
        }
        match save_config(store, &self.config) {
            Ok(()) => info!("configuration saved"),
            Err(err) => warn!("saving configuration failed: {err}"),
        }
    }

    /// One loop iteration: persist, refresh calendars, render and push the frame.
    pub fn tick<H, S, D>(
        &mut self,
        http: &mut H,
        store: &mut S,
        display: &mut D,
        local_time: Option<DateTime<FixedOffset>>,
        now_ms: u64,
    ) -> Result<RenderState>
    where
        H: HttpClient,
        S: ConfigStore,
        D: PixelDisplay,
    {
        self.save_if_due(store, now_ms);

        if let Some(now) = local_time {
            self.calendars
                .refresh_if_due(&self.config.icals, http, now.naive_local(), now_ms);
        }

        let notification = local_time
            .map(|now| evaluate(&self.config, &self.calendars, now.naive_local()))
            .unwrap_or_default();
        let open = local_time.is_some_and(|now| self.config.hours.is_open(now));

        let state = self.renderer.render(&Frame {
            config: &self.config,
            local_time,
            notification: &notification,
            open,
            now_ms,
        });
        self.renderer.show(display, self.config.brightness)?;
        Ok(state)
    }

    pub fn status(
        &self,
        local_time: Option<DateTime<FixedOffset>>,
        network: &NetworkInfo,
    ) -> PanelStatus {
        let notification = local_time
            .map(|now| evaluate(&self.config, &self.calendars, now.naive_local()))
            .unwrap_or_default();

        let ical_next = self
            .config
            .icals
            .iter()
            .enumerate()
            .map(|(slot, source)| CalendarStatus {
                url: source.url.clone(),
                color: source.color.clone(),
                next: self
                    .calendars
                    .next_start(slot)
                    .map_or(0, |at| self.epoch_seconds(at)),
            })
            .collect();

        PanelStatus {
            wifi: network.connected,
            ip: network.ip.clone(),
            mode: self.config.mode.as_str(),
            enable_appointments: self.config.enable_appointments,
            enable_open_hours: self.config.enable_open_hours,
            open: local_time.is_some_and(|now| self.config.hours.is_open(now)),
            time_synced: local_time.is_some(),
            next_appointment: notification
                .next
                .as_ref()
                .map_or(0, |event| self.epoch_seconds(event.at)),
            next_appointment_color: notification.next.map(|event| event.color),
            ical_next,
            notify_minutes_before: self.config.notify_minutes_before,
            notify_active: notification.active,
            version: FIRMWARE_VERSION,
        }
    }

    fn epoch_seconds(&self, local: NaiveDateTime) -> i64 {
        self.config.zone().to_utc(local).timestamp()
    }

    /// Runs an update to completion, drawing progress on the strip. Never reboots.
    pub fn run_update<H, F, C, S, D>(
        &mut self,
        job: &UpdateJob,
        devices: Devices<'_, H, F, C, S, D>,
    ) -> Result<Vec<UpdateReport>>
    where
        H: HttpClient,
        F: FlashSink,
        C: Clock,
        S: ConfigStore,
        D: PixelDisplay,
    {
        let Devices {
            http,
            flash,
            clock,
            store,
            display,
        } = devices;

        // The filesystem variant restores what is on disk, so it must match memory first.
        self.flush_save(store);

        let led_count = self.config.led_count;
        let brightness = self.config.brightness;
        let renderer = &mut self.renderer;
        let on_progress = |progress: &UpdateProgress| {
            renderer.render_progress(led_count, progress);
            if let Err(err) = renderer.show(display, brightness) {
                warn!("progress display failed: {err}");
            }
        };

        let mut updater = Updater::new(http, flash, clock, &self.update_settings);
        match job {
            UpdateJob::Firmware(request) => Ok(vec![updater.stream(request, on_progress)?]),
            UpdateJob::Filesystem(request) => Ok(vec![updater.filesystem_preserving_config(
                store,
                &request.url,
                request.sha256.clone(),
                on_progress,
            )?]),
            UpdateJob::Bundle {
                firmware,
                filesystem,
            } => {
                let report = updater.bundle(store, firmware, filesystem.as_ref(), on_progress)?;
                Ok(report.filesystem.into_iter().chain([report.firmware]).collect())
            }
        }
    }

    /// Serves one adapter request. Update requests block until the update has finished.
    pub fn handle<H, F, C, S, D>(
        &mut self,
        request: Request,
        devices: Devices<'_, H, F, C, S, D>,
        local_time: Option<DateTime<FixedOffset>>,
        network: &NetworkInfo,
    ) -> Response
    where
        H: HttpClient,
        F: FlashSink,
        C: Clock,
        S: ConfigStore,
        D: PixelDisplay,
    {
        let now_ms = devices.clock.now_ms();
        let result = match request {
            Request::GetConfig => Ok(Response::Config(Box::new(self.config.clone()))),
            Request::PatchConfig(patch) => {
                self.apply_config_patch(&patch, now_ms).map(|()| Response::Ok)
            }
            Request::Status => Ok(Response::Status(Box::new(self.status(local_time, network)))),
            Request::ListAppointments => Ok(Response::Appointments(self.appointments().to_vec())),
            Request::AddAppointment(body) => {
                if body.time.trim().is_empty() {
                    Err(PanelError::invalid("time missing"))
                } else {
                    self.add_appointment(&body.time, &body.color, now_ms)
                        .map(|()| Response::Ok)
                }
            }
            Request::DeleteAppointment(body) => body
                .index
                .ok_or_else(|| PanelError::invalid("invalid index"))
                .and_then(|index| self.remove_appointment(index, now_ms))
                .map(|_| Response::Ok),
            Request::Update(job) => self.run_update(&job, devices).map(Response::Rebooting),
        };
        result.unwrap_or_else(Response::Error)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        api::{AppointmentBody, DeleteAppointmentBody},
        color::WHITE,
        ota::{UpdateRequest, UpdateTarget},
        testing::{FakeClock, FakeFlash, FakeHttp, MemoryStore, RecordingDisplay, Route},
    };

    const FEED_URL: &str = "https://cal.example/team.ics";
    const FEED: &str = "BEGIN:VEVENT\nDTSTART:20250101T083000\nEND:VEVENT\n";

    fn berlin(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        let utc = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(hour - 1, minute, 0)
            .unwrap()
            .and_utc();
        DeviceConfig::default().local_time(utc)
    }

    #[derive(Default)]
    struct Rig {
        http: FakeHttp,
        flash: FakeFlash,
        clock: FakeClock,
        store: MemoryStore,
        display: RecordingDisplay,
    }

    impl Rig {
        fn devices(
            &mut self,
        ) -> Devices<'_, FakeHttp, FakeFlash, FakeClock, MemoryStore, RecordingDisplay> {
            Devices {
                http: &mut self.http,
                flash: &mut self.flash,
                clock: &self.clock,
                store: &mut self.store,
                display: &mut self.display,
            }
        }

        fn tick(&mut self, panel: &mut Panel, now: Option<DateTime<FixedOffset>>, now_ms: u64) {
            panel
                .tick(&mut self.http, &mut self.store, &mut self.display, now, now_ms)
                .unwrap();
        }
    }

    #[test]
    fn appointment_alert_blinks_on_the_strip() {
        let mut rig = Rig::default();
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        panel.add_appointment("2025-01-01 09:00", "ff00ff", 0).unwrap();

        rig.tick(&mut panel, Some(berlin(8, 45)), 400);

        assert_eq!(rig.display.last()[0].r, 255);
        assert_eq!(rig.display.last()[0].g, 0);
        assert_eq!(rig.display.frames[0].1, DeviceConfig::default().brightness);
        let status = panel.status(Some(berlin(8, 45)), &NetworkInfo::default());
        assert!(status.notify_active);
        assert_eq!(status.next_appointment_color.as_deref(), Some("ff00ff"));
    }

    #[test]
    fn status_reports_epochs_in_the_configured_zone() {
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        panel.add_appointment("2025-01-01 09:00", "ff00ff", 0).unwrap();

        let status = panel.status(Some(berlin(8, 0)), &NetworkInfo::default());

        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap().timestamp();
        assert_eq!(status.next_appointment, expected);
        assert_eq!(status.version, FIRMWARE_VERSION);
        assert!(status.time_synced);
    }

    #[test]
    fn appointment_in_the_spring_forward_gap_still_has_an_epoch() {
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        panel.add_appointment("2025-03-30 02:30", "ff00ff", 0).unwrap();
        let utc = Utc.with_ymd_and_hms(2025, 3, 30, 0, 0, 0).unwrap();
        let now = DeviceConfig::default().local_time(utc);

        let status = panel.status(Some(now), &NetworkInfo::default());

        let expected = Utc.with_ymd_and_hms(2025, 3, 30, 1, 30, 0).unwrap().timestamp();
        assert_eq!(status.next_appointment, expected);
    }

    #[test]
    fn calendars_refresh_on_first_tick_and_feed_status() {
        let mut rig = Rig {
            http: FakeHttp::default().with_route(FEED_URL, Route::ok(FEED.as_bytes())),
            ..Rig::default()
        };
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        panel
            .apply_config_patch(&json!({"icals": [{"url": FEED_URL, "color": "00ff00"}]}), 0)
            .unwrap();

        rig.tick(&mut panel, Some(berlin(8, 10)), 10);

        assert_eq!(rig.http.requests, vec![FEED_URL.to_string()]);
        let status = panel.status(Some(berlin(8, 10)), &NetworkInfo::default());
        assert_eq!(status.ical_next.len(), 1);
        assert!(status.ical_next[0].next > 0);
        assert!(status.notify_active);
        assert_eq!(rig.display.last()[0], WHITE);
    }

    #[test]
    fn unsynced_clock_skips_calendars() {
        let mut rig = Rig::default();
        let mut config = DeviceConfig::default();
        config.icals.push(crate::calendar::CalendarSource {
            url: FEED_URL.to_string(),
            color: "00ff00".to_string(),
        });
        let mut panel = Panel::new(config, 1);

        rig.tick(&mut panel, None, 0);

        assert!(rig.http.requests.is_empty());
        assert_eq!(rig.display.frames.len(), 1);
    }

    #[test]
    fn config_saves_are_debounced() {
        let mut rig = Rig::default();
        let mut panel = Panel::new(DeviceConfig::default(), 1);

        panel.apply_config_patch(&json!({"brightness": 12}), 100).unwrap();
        rig.tick(&mut panel, None, 200);
        assert_eq!(rig.store.saves, 0);

        rig.tick(&mut panel, None, 100 + SAVE_DEBOUNCE_MS);
        assert_eq!(rig.store.saves, 1);
        assert!(!panel.save_pending());
        let saved = DeviceConfig::from_json(rig.store.raw.as_deref().unwrap()).unwrap();
        assert_eq!(saved.brightness, 12);
    }

    #[test]
    fn rejected_patch_leaves_config_alone() {
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        assert!(panel.apply_config_patch(&json!({"tz": "Atlantis/Lost"}), 0).is_err());
        assert_eq!(panel.config(), &DeviceConfig::default());
        assert!(!panel.save_pending());
    }

    #[test]
    fn appointment_requests_round_trip_through_handle() {
        let mut rig = Rig::default();
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        let network = NetworkInfo::default();

        for time in ["2025-02-01 08:00", "2025-02-01 09:00"] {
            let body = AppointmentBody {
                time: time.to_string(),
                color: "00ff00".to_string(),
            };
            let response =
                panel.handle(Request::AddAppointment(body), rig.devices(), None, &network);
            assert!(matches!(response, Response::Ok));
        }

        let delete = DeleteAppointmentBody { index: Some(0) };
        panel.handle(Request::DeleteAppointment(delete), rig.devices(), None, &network);

        let Response::Appointments(list) =
            panel.handle(Request::ListAppointments, rig.devices(), None, &network)
        else {
            panic!("expected appointment list");
        };
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].time, "2025-02-01 09:00");

        let missing = DeleteAppointmentBody { index: Some(-1) };
        let response =
            panel.handle(Request::DeleteAppointment(missing), rig.devices(), None, &network);
        assert!(matches!(response, Response::Error(PanelError::InvalidInput(_))));
    }

    #[test]
    fn update_flushes_pending_config_and_draws_progress() {
        let image = vec![0xa5_u8; 4096];
        let url = "http://updates.local/fs.bin";
        let mut rig = Rig {
            http: FakeHttp::default().with_route(url, Route::ok(&image)),
            ..Rig::default()
        };
        let mut panel = Panel::new(DeviceConfig::default(), 1);
        panel.apply_config_patch(&json!({"brightness": 50}), 0).unwrap();

        let job = UpdateJob::Filesystem(UpdateRequest::new(UpdateTarget::Filesystem, url));
        let network = NetworkInfo::default();
        let response = panel.handle(Request::Update(job), rig.devices(), None, &network);

        assert!(response.is_reboot());
        assert_eq!(rig.flash.data, image);
        assert_eq!(rig.store.remounts, 1);
        let restored = DeviceConfig::from_json(rig.store.raw.as_deref().unwrap()).unwrap();
        assert_eq!(restored.brightness, 50);
        assert!(rig.display.frames.len() > 4);
        assert!(rig.display.frames.iter().all(|(_, brightness)| *brightness == 50));
    }

    #[test]
    fn failed_update_reports_without_reboot() {
        let url = "http://updates.local/fw.bin";
        let mut rig = Rig {
            http: FakeHttp::default().with_route(url, Route::status(500)),
            ..Rig::default()
        };
        let mut panel = Panel::new(DeviceConfig::default(), 1);

        let job = UpdateJob::Firmware(UpdateRequest::new(UpdateTarget::Firmware, url));
        let network = NetworkInfo::default();
        let response = panel.handle(Request::Update(job), rig.devices(), None, &network);

        assert!(!response.is_reboot());
        assert_eq!(response.to_json().0, 400);
        assert!(rig.flash.begun.is_empty());
    }
}
