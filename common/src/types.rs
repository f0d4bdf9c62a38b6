use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DisplayMode {
    #[default]
    Clock,
    Status,
    Effect,
}

impl DisplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clock => "clock",
            Self::Status => "status",
            Self::Effect => "effect",
        }
    }
}

impl From<String> for DisplayMode {
    /// Unknown names, including the retired `appointment` mode, fall back to the clock.
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "status" => Self::Status,
            "effect" => Self::Effect,
            _ => Self::Clock,
        }
    }
}

impl From<DisplayMode> for String {
    fn from(value: DisplayMode) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EffectKind {
    #[default]
    Rainbow,
    Solid,
    Breathe,
    Theater,
    Twinkle,
    Seasonal,
}

impl EffectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rainbow => "rainbow",
            Self::Solid => "solid",
            Self::Breathe => "breathe",
            Self::Theater => "theater",
            Self::Twinkle => "twinkle",
            Self::Seasonal => "seasonal",
        }
    }
}

impl From<String> for EffectKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "solid" => Self::Solid,
            "breathe" => Self::Breathe,
            "theater" => Self::Theater,
            "twinkle" => Self::Twinkle,
            "seasonal" | "xmas" => Self::Seasonal,
            _ => Self::Rainbow,
        }
    }
}

impl From<EffectKind> for String {
    fn from(value: EffectKind) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarStatus {
    pub url: String,
    pub color: String,
    /// Epoch seconds of the cached next start, 0 when unknown.
    pub next: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PanelStatus {
    pub wifi: bool,
    pub ip: String,
    pub mode: &'static str,
    #[serde(rename = "enableAppointments")]
    pub enable_appointments: bool,
    #[serde(rename = "enableOpenHours")]
    pub enable_open_hours: bool,
    pub open: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "nextAppointment")]
    pub next_appointment: i64,
    #[serde(rename = "nextAppointmentColor")]
    pub next_appointment_color: Option<String>,
    #[serde(rename = "icalNext")]
    pub ical_next: Vec<CalendarStatus>,
    #[serde(rename = "notifyMinutesBefore")]
    pub notify_minutes_before: u16,
    #[serde(rename = "notifyActive")]
    pub notify_active: bool,
    pub version: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_falls_back_to_clock() {
        let mode: DisplayMode = serde_json::from_str("\"appointment\"").unwrap();
        assert_eq!(mode, DisplayMode::Clock);
        let mode: DisplayMode = serde_json::from_str("\"Effect\"").unwrap();
        assert_eq!(mode, DisplayMode::Effect);
    }

    #[test]
    fn legacy_effect_names_are_accepted() {
        let effect: EffectKind = serde_json::from_str("\"xmas\"").unwrap();
        assert_eq!(effect, EffectKind::Seasonal);
        let effect: EffectKind = serde_json::from_str("\"sparkle\"").unwrap();
        assert_eq!(effect, EffectKind::Rainbow);
        assert_eq!(
            serde_json::to_string(&EffectKind::Seasonal).unwrap(),
            "\"seasonal\""
        );
    }
}
