//! Manual appointments and the merge of every event source into one "next event".

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use smart_leds::RGB8;

use crate::{
    calendar::CalendarCache,
    color::{is_hex_color, parse_hex},
    config::DeviceConfig,
    error::{PanelError, Result},
};

pub const MAX_APPOINTMENTS: usize = 10;
pub const DEFAULT_APPOINTMENT_COLOR: &str = "00ffff";

const DEFAULT_ALERT: RGB8 = RGB8 {
    r: 0x00,
    g: 0xff,
    b: 0xff,
};

fn default_color() -> String {
    DEFAULT_APPOINTMENT_COLOR.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAppointment {
    pub time: String,
    #[serde(default = "default_color")]
    pub color: String,
}

/// Bounded, insertion-ordered list of manual appointments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentList {
    entries: Vec<ManualAppointment>,
}

impl AppointmentList {
    pub fn entries(&self) -> &[ManualAppointment] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an appointment. Malformed colors become the default alert color.
    pub fn add(&mut self, time: &str, color: &str) -> Result<&ManualAppointment> {
        if self.entries.len() >= MAX_APPOINTMENTS {
            return Err(PanelError::invalid(format!(
                "appointment list is full ({MAX_APPOINTMENTS} entries)"
            )));
        }
        let time = time.trim();
        if parse_local_timestamp(time).is_none() {
            return Err(PanelError::invalid(format!(
                "invalid appointment time {time:?}, expected YYYY-MM-DD HH:MM"
            )));
        }

        let color = color.trim().trim_start_matches('#');
        let color = if is_hex_color(color) {
            color.to_ascii_lowercase()
        } else {
            default_color()
        };

        self.entries.push(ManualAppointment {
            time: time.to_string(),
            color,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn remove(&mut self, index: usize) -> Result<ManualAppointment> {
        if index >= self.entries.len() {
            return Err(PanelError::invalid(format!(
                "appointment index {index} out of range ({} entries)",
                self.entries.len()
            )));
        }
        Ok(self.entries.remove(index))
    }

    pub(crate) fn truncate_to_capacity(&mut self) {
        self.entries.truncate(MAX_APPOINTMENTS);
    }
}

/// Parses `YYYY-MM-DD HH:MM` (any separator at position 10) as a local timestamp.
pub fn parse_local_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    let rest = value.get(16..)?;
    if !(rest.is_empty() || rest.starts_with(':')) {
        return None;
    }

    let date = NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(value.get(11..16)?, "%H:%M").ok()?;
    Some(date.and_time(time))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Manual(usize),
    Legacy,
    Calendar(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextEvent {
    pub at: NaiveDateTime,
    pub color: String,
    pub source: EventSource,
}

impl NextEvent {
    pub fn seconds_until(&self, now: NaiveDateTime) -> i64 {
        (self.at - now).num_seconds()
    }

    pub fn alert_color(&self) -> RGB8 {
        parse_hex(&self.color).unwrap_or(DEFAULT_ALERT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub next: Option<NextEvent>,
    pub active: bool,
}

fn is_upcoming(at: NaiveDateTime, now: NaiveDateTime) -> bool {
    at >= now
}

/// Earliest upcoming manual appointment, then the legacy single slot if strictly earlier.
pub fn next_manual_event(
    appointments: &AppointmentList,
    legacy: &str,
    now: NaiveDateTime,
) -> Option<NextEvent> {
    let mut best: Option<NextEvent> = None;

    for (index, appointment) in appointments.entries().iter().enumerate() {
        let Some(at) = parse_local_timestamp(&appointment.time) else {
            continue;
        };
        if !is_upcoming(at, now) || best.as_ref().is_some_and(|current| at >= current.at) {
            continue;
        }
        best = Some(NextEvent {
            at,
            color: appointment.color.clone(),
            source: EventSource::Manual(index),
        });
    }

    if let Some(at) = parse_local_timestamp(legacy).filter(|at| is_upcoming(*at, now)) {
        if best.as_ref().map_or(true, |current| at < current.at) {
            best = Some(NextEvent {
                at,
                color: default_color(),
                source: EventSource::Legacy,
            });
        }
    }

    best
}

/// Merges manual sources with every cached calendar occurrence; ties keep the earlier source.
pub fn next_event(
    config: &DeviceConfig,
    calendars: &CalendarCache,
    now: NaiveDateTime,
) -> Option<NextEvent> {
    let mut best = if config.enable_appointments {
        next_manual_event(&config.appointments, &config.appointment_time, now)
    } else {
        None
    };

    for (slot, source) in config.icals.iter().enumerate() {
        let Some(at) = calendars.next_start(slot) else {
            continue;
        };
        if !is_upcoming(at, now) || best.as_ref().is_some_and(|current| at >= current.at) {
            continue;
        }
        let color = if is_hex_color(&source.color) {
            source.color.clone()
        } else {
            config.ical_color.clone()
        };
        best = Some(NextEvent {
            at,
            color,
            source: EventSource::Calendar(slot),
        });
    }

    best
}

pub fn is_within_notify_window(event: &NextEvent, now: NaiveDateTime, minutes: u16) -> bool {
    let delta = event.seconds_until(now);
    (0..=i64::from(minutes) * 60).contains(&delta)
}

/// Next event plus whether its alert should be shown right now.
pub fn evaluate(
    config: &DeviceConfig,
    calendars: &CalendarCache,
    now: NaiveDateTime,
) -> Notification {
    let next = next_event(config, calendars, now);
    let active = config.enable_appointments
        && next.as_ref().is_some_and(|event| {
            is_within_notify_window(event, now, config.notify_minutes_before)
        });
    Notification { next, active }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::calendar::CalendarSource;

    fn at(value: &str) -> NaiveDateTime {
        parse_local_timestamp(value).unwrap()
    }

    fn calendar(url: &str, color: &str) -> CalendarSource {
        CalendarSource {
            url: url.to_string(),
            color: color.to_string(),
        }
    }

    #[test]
    fn parses_local_timestamps() {
        assert_eq!(
            parse_local_timestamp("2025-01-01 09:00"),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(9, 0, 0)
        );
        assert!(parse_local_timestamp("2025-01-01T09:00").is_some());
        assert!(parse_local_timestamp("2025-01-01 09:00:30").is_some());
        for bad in ["", "2025-01-01", "2025-13-01 09:00", "2025-01-01 25:00", "tomorrow 9am!"] {
            assert_eq!(parse_local_timestamp(bad), None, "{bad}");
        }
    }

    #[test]
    fn appointment_inside_lead_time_is_active() {
        let mut config = DeviceConfig::default();
        config.appointments.add("2025-01-01 09:00", "ff00ff").unwrap();

        let notification = evaluate(&config, &CalendarCache::default(), at("2025-01-01 08:45"));

        assert!(notification.active);
        let next = notification.next.unwrap();
        assert_eq!(next.color, "ff00ff");
        assert_eq!(next.alert_color(), RGB8::new(255, 0, 255));
    }

    #[test]
    fn notify_window_bounds() {
        let event = NextEvent {
            at: at("2025-01-01 09:00"),
            color: "ff00ff".to_string(),
            source: EventSource::Manual(0),
        };
        assert!(is_within_notify_window(&event, at("2025-01-01 08:30"), 30));
        assert!(!is_within_notify_window(&event, at("2025-01-01 08:29"), 30));
        assert!(is_within_notify_window(&event, at("2025-01-01 09:00"), 30));
        assert!(!is_within_notify_window(&event, at("2025-01-01 09:01"), 30));
    }

    #[test]
    fn earliest_future_source_wins() {
        let mut config = DeviceConfig::default();
        config.appointments.add("2025-01-01 07:00", "111111").unwrap();
        config.appointments.add("2025-01-01 12:00", "222222").unwrap();
        config.icals = vec![
            calendar("https://a.example/cal.ics", "333333"),
            calendar("https://b.example/cal.ics", "444444"),
        ];
        let mut calendars = CalendarCache::default();
        calendars.set_next_start(0, Some(at("2025-01-01 11:00")));
        calendars.set_next_start(1, Some(at("2025-01-01 10:30")));

        let next = next_event(&config, &calendars, at("2025-01-01 08:00")).unwrap();

        assert_eq!(next.color, "444444");
        assert_eq!(next.source, EventSource::Calendar(1));
    }

    #[test]
    fn manual_appointment_wins_ties_with_calendars() {
        let mut config = DeviceConfig::default();
        config.appointments.add("2025-01-01 10:00", "ff00ff").unwrap();
        config.icals = vec![
            calendar("https://a.example/cal.ics", "00ff00"),
            calendar("https://b.example/cal.ics", "0000ff"),
        ];
        let mut calendars = CalendarCache::default();
        calendars.set_next_start(0, Some(at("2025-01-01 10:00")));
        calendars.set_next_start(1, Some(at("2025-01-01 10:00")));

        let next = next_event(&config, &calendars, at("2025-01-01 09:00")).unwrap();
        assert_eq!(next.color, "ff00ff");
    }

    #[test]
    fn legacy_slot_only_replaces_when_strictly_earlier() {
        let mut appointments = AppointmentList::default();
        appointments.add("2025-01-01 10:00", "ff00ff").unwrap();
        let now = at("2025-01-01 09:00");

        let tie = next_manual_event(&appointments, "2025-01-01 10:00", now).unwrap();
        assert_eq!(tie.source, EventSource::Manual(0));

        let earlier = next_manual_event(&appointments, "2025-01-01 09:30", now).unwrap();
        assert_eq!(earlier.source, EventSource::Legacy);
        assert_eq!(earlier.color, DEFAULT_APPOINTMENT_COLOR);
    }

    #[test]
    fn unknown_calendar_slot_contributes_nothing() {
        let mut config = DeviceConfig::default();
        config.icals = vec![calendar("https://a.example/cal.ics", "00ff00")];

        assert_eq!(
            next_event(&config, &CalendarCache::default(), at("2025-01-01 09:00")),
            None
        );
    }

    #[test]
    fn past_and_malformed_entries_are_skipped() {
        let mut config = DeviceConfig::default();
        config.appointments.add("2024-12-31 23:59", "ff0000").unwrap();
        config.appointment_time = "soon".to_string();

        assert_eq!(next_event(&config, &CalendarCache::default(), at("2025-01-01 00:00")), None);
    }

    #[test]
    fn malformed_calendar_color_uses_legacy_color() {
        let mut config = DeviceConfig::default();
        config.ical_color = "abcdef".to_string();
        config.icals = vec![calendar("https://a.example/cal.ics", "purple")];
        let mut calendars = CalendarCache::default();
        calendars.set_next_start(0, Some(at("2025-01-01 10:00")));

        let next = next_event(&config, &calendars, at("2025-01-01 09:00")).unwrap();
        assert_eq!(next.color, "abcdef");
    }

    #[test]
    fn disabled_appointments_silence_every_alert() {
        let mut config = DeviceConfig::default();
        config.enable_appointments = false;
        config.appointments.add("2025-01-01 09:10", "ff00ff").unwrap();
        config.icals = vec![calendar("https://a.example/cal.ics", "00ff00")];
        let mut calendars = CalendarCache::default();
        calendars.set_next_start(0, Some(at("2025-01-01 09:20")));

        let notification = evaluate(&config, &calendars, at("2025-01-01 09:00"));

        assert!(!notification.active);
        assert_eq!(
            notification.next.map(|event| event.source),
            Some(EventSource::Calendar(0))
        );
    }

    #[test]
    fn add_rejects_when_full_or_malformed() {
        let mut list = AppointmentList::default();
        assert!(list.add("next tuesday", "ff00ff").is_err());
        assert!(list.is_empty());

        for day in 1..=MAX_APPOINTMENTS {
            list.add(&format!("2025-02-{day:02} 09:00"), "#FF00FF").unwrap();
        }
        assert!(list.add("2025-03-01 09:00", "ff00ff").is_err());
        assert_eq!(list.len(), MAX_APPOINTMENTS);
        assert_eq!(list.entries()[0].color, "ff00ff");
    }

    #[test]
    fn add_replaces_bad_colors() {
        let mut list = AppointmentList::default();
        let added = list.add("2025-02-01 09:00", "blue").unwrap();
        assert_eq!(added.color, DEFAULT_APPOINTMENT_COLOR);
    }

    #[test]
    fn remove_preserves_order() {
        let mut list = AppointmentList::default();
        for hour in ["08", "09", "10", "11"] {
            list.add(&format!("2025-02-01 {hour}:00"), "ff00ff").unwrap();
        }

        let removed = list.remove(1).unwrap();

        assert_eq!(removed.time, "2025-02-01 09:00");
        let times: Vec<_> = list.entries().iter().map(|a| a.time.as_str()).collect();
        assert_eq!(times, ["2025-02-01 08:00", "2025-02-01 10:00", "2025-02-01 11:00"]);
    }

    #[test]
    fn remove_out_of_range_is_a_no_op() {
        let mut list = AppointmentList::default();
        list.add("2025-02-01 08:00", "ff00ff").unwrap();

        assert!(list.remove(1).is_err());
        assert_eq!(list.len(), 1);
    }
}
