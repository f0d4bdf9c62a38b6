//! Best-effort calendar feed reader: only `DTSTART` lines are looked at, and their times are
//! taken as local wall-clock time whatever zone marker they carry.

use std::{io::Read, time::Duration};

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PanelError, Result},
    io::HttpClient,
};

pub const MAX_CALENDARS: usize = 5;
pub const REFRESH_INTERVAL_MS: u64 = 30 * 60 * 1000;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_BODY_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSource {
    pub url: String,
    #[serde(default)]
    pub color: String,
}

/// Cached next occurrence per calendar slot plus the refresh cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarCache {
    next: [Option<NaiveDateTime>; MAX_CALENDARS],
    last_refresh_ms: Option<u64>,
}

impl CalendarCache {
    pub fn next_start(&self, slot: usize) -> Option<NaiveDateTime> {
        self.next.get(slot).copied().flatten()
    }

    pub fn set_next_start(&mut self, slot: usize, value: Option<NaiveDateTime>) {
        if let Some(entry) = self.next.get_mut(slot) {
            *entry = value;
        }
    }

    /// Forgets every cached value and makes the next refresh due immediately.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_refresh_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= REFRESH_INTERVAL_MS)
    }

    /// Refreshes every slot when the cadence has elapsed. Returns whether a refresh ran.
    pub fn refresh_if_due<H: HttpClient>(
        &mut self,
        sources: &[CalendarSource],
        http: &mut H,
        now: NaiveDateTime,
        now_ms: u64,
    ) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_refresh_ms = Some(now_ms);
        self.refresh(sources, http, now);
        true
    }

    pub fn refresh<H: HttpClient>(
        &mut self,
        sources: &[CalendarSource],
        http: &mut H,
        now: NaiveDateTime,
    ) {
        for slot in 0..MAX_CALENDARS {
            let Some(source) = sources.get(slot).filter(|s| !s.url.trim().is_empty()) else {
                self.next[slot] = None;
                continue;
            };

            self.next[slot] = match fetch_body(http, source.url.trim()) {
                Ok(body) => {
                    let next = earliest_start(&body, now);
                    info!("calendar {slot}: next start {next:?}");
                    next
                }
                Err(err) => {
                    warn!("calendar {slot} fetch failed for {}: {err}", source.url);
                    None
                }
            };
        }
    }
}

fn fetch_body<H: HttpClient>(http: &mut H, url: &str) -> Result<String> {
    let response = http.get(url, FETCH_TIMEOUT)?;
    if !response.is_success() {
        return Err(PanelError::HttpStatus(response.status));
    }
    if response.content_length.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Err(PanelError::invalid(format!(
            "calendar body exceeds {MAX_BODY_BYTES} bytes"
        )));
    }

    let mut bytes = Vec::new();
    response
        .body
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| PanelError::NetworkUnavailable(err.to_string()))?;
    if bytes.len() as u64 > MAX_BODY_BYTES {
        return Err(PanelError::invalid(format!(
            "calendar body exceeds {MAX_BODY_BYTES} bytes"
        )));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Earliest start at or after `now`, else the earliest start at all.
pub fn earliest_start(body: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut earliest_future: Option<NaiveDateTime> = None;
    let mut earliest_any: Option<NaiveDateTime> = None;

    for line in unfolded_lines(body) {
        if !line.starts_with("DTSTART") {
            continue;
        }
        let Some(start) = parse_dtstart(&line) else {
            debug!("skipping unparsable {line:?}");
            continue;
        };

        if start >= now && earliest_future.map_or(true, |best| start < best) {
            earliest_future = Some(start);
        }
        if earliest_any.map_or(true, |best| start < best) {
            earliest_any = Some(start);
        }
    }

    earliest_future.or(earliest_any)
}

/// Joins folded continuation lines (leading space or tab) onto their parent line.
fn unfolded_lines(body: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match lines.last_mut() {
            Some(current) if raw.starts_with([' ', '\t']) => current.push_str(raw.trim()),
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

/// Parses the value of a `DTSTART[;params]:YYYYMMDD[THHMMSS][Z]` line.
pub fn parse_dtstart(line: &str) -> Option<NaiveDateTime> {
    let (_, value) = line.split_once(':')?;
    let mut digits: String = value.trim().chars().filter(|c| !matches!(c, 'Z' | 'T')).collect();
    if digits.len() < 8 {
        return None;
    }
    while digits.len() < 14 {
        digits.push('0');
    }

    let stamp = digits.get(..14)?;
    if !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()
}
