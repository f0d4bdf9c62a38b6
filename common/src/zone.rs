//! The `tz` setting: an IANA zone name, or a POSIX TZ rule such as
//! `CET-1CEST,M3.5.0,M10.5.0/3` as written by older firmware.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub enum Zone {
    Iana(Tz),
    Posix(tz::TimeZone),
}

impl Zone {
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if let Ok(zone) = name.parse::<Tz>() {
            return Some(Self::Iana(zone));
        }
        if !looks_like_posix_rule(name) {
            return None;
        }
        tz::TimeZone::from_posix_tz(name).ok().map(Self::Posix)
    }

    pub fn offset_at(&self, utc: DateTime<Utc>) -> FixedOffset {
        match self {
            Self::Iana(zone) => zone.offset_from_utc_datetime(&utc.naive_utc()).fix(),
            Self::Posix(zone) => zone
                .find_local_time_type(utc.timestamp())
                .ok()
                .and_then(|kind| FixedOffset::east_opt(kind.ut_offset()))
                .unwrap_or(Utc.fix()),
        }
    }

    /// Resolves a local wall time. Repeated times take the earlier instant; times skipped
    /// by a forward shift use the offset in force before the shift.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let wall = local.and_utc();
        let before = self.offset_at(wall - Duration::days(1));
        let after = self.offset_at(wall + Duration::days(1));
        let shift = |offset: FixedOffset| wall - Duration::seconds(offset.local_minus_utc().into());

        [before, after]
            .into_iter()
            .filter_map(|offset| {
                let utc = shift(offset);
                (self.offset_at(utc) == offset).then_some(utc)
            })
            .min()
            .unwrap_or_else(|| shift(before))
    }
}

// A rule names a zone abbreviation and carries a numeric offset. Anything else would make
// tz-rs look for a zoneinfo file.
fn looks_like_posix_rule(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '<')
        && name.chars().any(|c| c.is_ascii_digit())
        && !name.contains("..")
        && name != "localtime"
}
