use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    calendar::{CalendarSource, MAX_CALENDARS},
    error::{PanelError, Result},
    events::{AppointmentList, DEFAULT_APPOINTMENT_COLOR},
    hours::OpenHours,
    io::ConfigStore,
    types::{DisplayMode, EffectKind},
    zone::Zone,
};

pub const FIRMWARE_VERSION: &str = "v0.7.3";
pub const DEFAULT_LED_COUNT: u16 = 12;
pub const MAX_LED_COUNT: u16 = 300;
pub const MIN_EFFECT_SPEED: u8 = 1;
pub const MAX_EFFECT_SPEED: u8 = 20;
pub const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

/// The persisted device document. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub led_count: u16,
    pub brightness: u8,
    pub mode: DisplayMode,
    #[serde(rename = "tz")]
    pub timezone: String,
    pub ical_url: String,
    pub ical_color: String,
    pub icals: Vec<CalendarSource>,
    pub enable_appointments: bool,
    pub enable_open_hours: bool,
    pub appointment_time: String,
    pub appointments: AppointmentList,
    pub notify_minutes_before: u16,
    pub open_color: String,
    pub closed_color: String,
    pub clock_color: String,
    pub effect: EffectKind,
    pub effect_color: String,
    pub effect_speed: u8,
    pub hours: OpenHours,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            led_count: DEFAULT_LED_COUNT,
            brightness: 96,
            mode: DisplayMode::Clock,
            timezone: DEFAULT_TIMEZONE.to_string(),
            ical_url: String::new(),
            ical_color: DEFAULT_APPOINTMENT_COLOR.to_string(),
            icals: Vec::new(),
            enable_appointments: true,
            enable_open_hours: true,
            appointment_time: String::new(),
            appointments: AppointmentList::default(),
            notify_minutes_before: 30,
            open_color: "00ff00".to_string(),
            closed_color: "ff0000".to_string(),
            clock_color: "ffffff".to_string(),
            effect: EffectKind::Rainbow,
            effect_color: "ffffff".to_string(),
            effect_speed: 4,
            hours: OpenHours::default(),
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.led_count = self.led_count.clamp(1, MAX_LED_COUNT);
        self.effect_speed = self.effect_speed.clamp(MIN_EFFECT_SPEED, MAX_EFFECT_SPEED);
        self.appointments.truncate_to_capacity();
        self.hours.normalize();

        if self.timezone.trim().is_empty() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
        if Zone::parse(&self.timezone).is_none() {
            warn!("unknown timezone {:?}, clock runs on UTC", self.timezone);
        }

        let ical_color = self.ical_color.clone();
        self.icals.retain(|source| !source.url.trim().is_empty());
        self.icals.truncate(MAX_CALENDARS);
        for source in &mut self.icals {
            if source.color.trim().is_empty() {
                source.color = ical_color.clone();
            }
        }

        if self.icals.is_empty() && !self.ical_url.trim().is_empty() {
            info!("migrating legacy calendar url into slot 0");
            self.icals.push(CalendarSource {
                url: self.ical_url.trim().to_string(),
                color: ical_color,
            });
        }
    }

    /// Deserializes and sanitizes a stored document.
    ///
    /// A field whose value does not fit its type is dropped and takes its default; only a
    /// document that is not a JSON object at all is corrupt.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let document: Value = serde_json::from_slice(raw)
            .map_err(|err| PanelError::ConfigCorrupt(err.to_string()))?;
        let Value::Object(fields) = document else {
            return Err(PanelError::ConfigCorrupt(
                "config document is not a JSON object".to_string(),
            ));
        };

        let usable: Map<String, Value> = fields
            .into_iter()
            .filter(|(key, value)| {
                let single = Map::from_iter([(key.clone(), value.clone())]);
                match serde_json::from_value::<Self>(Value::Object(single)) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!("config field {key:?} ignored: {err}");
                        false
                    }
                }
            })
            .collect();

        let mut config: Self = serde_json::from_value(Value::Object(usable))
            .map_err(|err| PanelError::ConfigCorrupt(err.to_string()))?;
        config.sanitize();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|err| PanelError::Storage(err.to_string()))
    }

    /// Overlays the top-level keys of `patch` on this config and returns the result.
    ///
    /// Nothing is applied when the merged document does not deserialize or names an
    /// unknown timezone.
    pub fn merged_with(&self, patch: &Value) -> Result<Self> {
        let Value::Object(patch) = patch else {
            return Err(PanelError::invalid("config update must be a JSON object"));
        };

        if let Some(tz) = patch.get("tz") {
            let name = tz
                .as_str()
                .ok_or_else(|| PanelError::invalid("tz must be a string"))?;
            if Zone::parse(name).is_none() {
                return Err(PanelError::invalid(format!("unknown timezone {name:?}")));
            }
        }

        let mut merged = serde_json::to_value(self)
            .map_err(|err| PanelError::invalid(err.to_string()))?;
        if let Value::Object(current) = &mut merged {
            for (key, value) in patch {
                current.insert(key.clone(), value.clone());
            }
        }

        let mut config: Self = serde_json::from_value(merged)
            .map_err(|err| PanelError::invalid(format!("invalid config: {err}")))?;
        config.sanitize();
        Ok(config)
    }

    /// The configured zone; UTC when the setting does not resolve.
    pub fn zone(&self) -> Zone {
        Zone::parse(&self.timezone).unwrap_or(Zone::Iana(Tz::UTC))
    }

    pub fn local_time(&self, utc: DateTime<Utc>) -> DateTime<FixedOffset> {
        utc.with_timezone(&self.zone().offset_at(utc))
    }
}

/// Loads the stored config, falling back to (and immediately persisting) the defaults.
pub fn load_config<S: ConfigStore>(store: &mut S) -> DeviceConfig {
    match store.load_raw() {
        Ok(Some(raw)) => match DeviceConfig::from_json(&raw) {
            Ok(config) => return config,
            Err(err) => warn!("{err}; using defaults"),
        },
        Ok(None) => info!("no stored configuration, writing defaults"),
        Err(err) => warn!("reading configuration failed: {err}; using defaults"),
    }

    let config = DeviceConfig::default();
    if let Err(err) = save_config(store, &config) {
        warn!("persisting default configuration failed: {err}");
    }
    config
}

pub fn save_config<S: ConfigStore>(store: &mut S, config: &DeviceConfig) -> Result<()> {
    let payload = config.to_json()?;
    store.save_raw(&payload)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{events::ManualAppointment, hours::DayWindow, testing::MemoryStore};

    #[test]
    fn written_config_reads_back_unchanged() {
        let mut config = DeviceConfig {
            led_count: 24,
            brightness: 200,
            mode: DisplayMode::Effect,
            timezone: "America/New_York".to_string(),
            ical_url: "https://cal.example/legacy.ics".to_string(),
            ical_color: "abcdef".to_string(),
            icals: vec![CalendarSource {
                url: "https://cal.example/a.ics".to_string(),
                color: "ff8800".to_string(),
            }],
            enable_appointments: false,
            enable_open_hours: false,
            appointment_time: "2025-04-02 14:00".to_string(),
            appointments: AppointmentList::default(),
            notify_minutes_before: 10,
            open_color: "112233".to_string(),
            closed_color: "445566".to_string(),
            clock_color: "778899".to_string(),
            effect: EffectKind::Twinkle,
            effect_color: "aabbcc".to_string(),
            effect_speed: 12,
            hours: OpenHours::from_days(vec![DayWindow::new("07:30", "18:00"); 7]),
        };
        config.appointments.add("2025-03-01 10:15", "ff00ff").unwrap();

        let mut store = MemoryStore::default();
        save_config(&mut store, &config).unwrap();

        assert_eq!(load_config(&mut store), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = DeviceConfig::from_json(br#"{"ledCount": 30}"#).unwrap();

        assert_eq!(config.led_count, 30);
        assert_eq!(config.brightness, 96);
        assert_eq!(config.timezone, DEFAULT_TIMEZONE);
        assert_eq!(config.hours, OpenHours::default());
        assert!(config.enable_appointments);
    }

    #[test]
    fn corrupt_document_falls_back_and_is_rewritten() {
        let mut store = MemoryStore::with(b"{not json");

        let config = load_config(&mut store);

        assert_eq!(config, DeviceConfig::default());
        assert_eq!(store.saves, 1);
        let rewritten = DeviceConfig::from_json(store.raw.as_deref().unwrap()).unwrap();
        assert_eq!(rewritten, DeviceConfig::default());
    }

    #[test]
    fn one_bad_field_keeps_the_rest_of_the_stored_document() {
        let raw = json!({
            "brightness": 300,
            "notifyMinutesBefore": 70000,
            "mode": null,
            "ledCount": 24,
            "appointments": [{"time": "2025-01-01 09:00", "color": "ff00ff"}],
            "icals": [{"url": "https://cal.example/a.ics", "color": "00ff00"}],
        })
        .to_string();
        let mut store = MemoryStore::with(raw.as_bytes());

        let config = load_config(&mut store);

        assert_eq!(config.brightness, 96);
        assert_eq!(config.notify_minutes_before, 30);
        assert_eq!(config.mode, DisplayMode::Clock);
        assert_eq!(config.led_count, 24);
        assert_eq!(config.appointments.len(), 1);
        assert_eq!(config.icals.len(), 1);
        assert_eq!(store.saves, 0);
        assert_eq!(store.raw.as_deref(), Some(raw.as_bytes()));
    }

    #[test]
    fn non_object_document_is_corrupt() {
        assert!(matches!(
            DeviceConfig::from_json(b"[1, 2, 3]"),
            Err(PanelError::ConfigCorrupt(_))
        ));
    }

    #[test]
    fn empty_store_persists_defaults() {
        let mut store = MemoryStore::default();
        load_config(&mut store);
        assert_eq!(store.saves, 1);
    }

    #[test]
    fn legacy_calendar_url_moves_into_first_slot() {
        let config = DeviceConfig::from_json(
            br#"{"icalUrl": "https://cal.example/legacy.ics", "icalColor": "123456"}"#,
        )
        .unwrap();

        assert_eq!(
            config.icals,
            vec![CalendarSource {
                url: "https://cal.example/legacy.ics".to_string(),
                color: "123456".to_string(),
            }]
        );
    }

    #[test]
    fn sanitize_clamps_and_caps() {
        let icals: Vec<_> = (0..8)
            .map(|i| json!({"url": format!("https://cal.example/{i}.ics")}))
            .chain([json!({"url": "  "})])
            .collect();
        let appointments: Vec<_> = (0..14)
            .map(|i| json!({"time": format!("2025-01-{:02} 09:00", i + 1), "color": "00ff00"}))
            .collect();
        let raw = json!({
            "ledCount": 0,
            "effectSpeed": 99,
            "mode": "appointment",
            "effect": "xmas",
            "icalColor": "abcdef",
            "icals": icals,
            "appointments": appointments,
            "hours": [{"start": "09:00", "end": "17:00"}],
        });

        let config = DeviceConfig::from_json(raw.to_string().as_bytes()).unwrap();

        assert_eq!(config.led_count, 1);
        assert_eq!(config.effect_speed, MAX_EFFECT_SPEED);
        assert_eq!(config.mode, DisplayMode::Clock);
        assert_eq!(config.effect, EffectKind::Seasonal);
        assert_eq!(config.icals.len(), MAX_CALENDARS);
        assert!(config.icals.iter().all(|source| source.color == "abcdef"));
        assert_eq!(config.appointments.len(), 10);
        assert_eq!(config.hours.days().len(), 7);
    }

    #[test]
    fn merge_overlays_only_given_keys() {
        let mut base = DeviceConfig::default();
        base.appointments.add("2025-01-01 09:00", "ff00ff").unwrap();

        let merged = base
            .merged_with(&json!({"brightness": 10, "mode": "status"}))
            .unwrap();

        assert_eq!(merged.brightness, 10);
        assert_eq!(merged.mode, DisplayMode::Status);
        assert_eq!(
            merged.appointments.entries(),
            &[ManualAppointment {
                time: "2025-01-01 09:00".to_string(),
                color: "ff00ff".to_string(),
            }]
        );
    }

    #[test]
    fn merge_rejects_bad_documents() {
        let base = DeviceConfig::default();
        assert!(base.merged_with(&json!([1, 2])).is_err());
        assert!(base.merged_with(&json!({"tz": "Mars/Olympus"})).is_err());
        assert!(base.merged_with(&json!({"brightness": "bright"})).is_err());
    }

    #[test]
    fn local_time_follows_the_zone() {
        let config = DeviceConfig::default();
        let utc = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        assert_eq!(config.local_time(utc).hour(), 12);

        let config = DeviceConfig {
            timezone: "Nowhere/Special".to_string(),
            ..DeviceConfig::default()
        };
        assert_eq!(config.local_time(utc).hour(), 10);
    }

    #[test]
    fn posix_timezone_rule_is_understood() {
        let config = DeviceConfig::from_json(br#"{"tz": "CET-1CEST,M3.5.0,M10.5.0/3"}"#).unwrap();
        let utc = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        assert_eq!(config.local_time(utc).hour(), 12);

        let merged = DeviceConfig::default()
            .merged_with(&json!({"tz": "CET-1CEST,M3.5.0,M10.5.0/3"}))
            .unwrap();
        assert_eq!(merged.timezone, "CET-1CEST,M3.5.0,M10.5.0/3");
    }
}
