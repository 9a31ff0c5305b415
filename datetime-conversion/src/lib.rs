extern crate chrono;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};

pub fn datetime_to_f64<TZ>(dt: &DateTime<TZ>) -> f64
    where
        TZ: TimeZone,
{
    let secs = dt.timestamp() as i32;
    let nsecs = dt.timestamp_subsec_nanos() as i32;
    (secs as f64) + (nsecs as f64 * 1e-9)
}

pub fn f64_to_datetime(timestamp_f64: f64) -> DateTime<Local> {
    let secs_f = timestamp_f64.floor();
    let secs = secs_f as i64;
    let nsecs = ((timestamp_f64 - secs_f) * 1e9) as u32;
    Local.timestamp(secs, nsecs)
}

/// A broken-down timestamp matching the DS3232 RTC's on-wire register layout
/// (a C `tmElements_t`): seconds/minutes/hours, day-of-week (1=Sun..7=Sat),
/// day-of-month, month (1..12) and a year offset from 1970.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmElements {
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    pub dow: u8,
    pub day: u8,
    pub mon: u8,
    pub year_offset: u8,
}

/// Break a `NaiveDateTime` into its `TmElements` representation.
///
/// Inverse of [`rtc_make`].
pub fn rtc_break(dt: &NaiveDateTime) -> TmElements {
    // chrono's weekday() is Mon=0..Sun=6; the wire format wants Sun=1..Sat=7.
    let dow = ((dt.weekday().num_days_from_sunday()) + 1) as u8;
    TmElements {
        sec: dt.second() as u8,
        min: dt.minute() as u8,
        hour: dt.hour() as u8,
        dow,
        day: dt.day() as u8,
        mon: dt.month() as u8,
        year_offset: (dt.year() - 1970) as u8,
    }
}

/// Reassemble a `NaiveDateTime` from its `TmElements` representation.
///
/// Inverse of [`rtc_break`]. The `dow` field is not used for reconstruction;
/// it is carried only because the wire format stores it redundantly.
pub fn rtc_make(tm: &TmElements) -> NaiveDateTime {
    let year = 1970 + tm.year_offset as i32;
    NaiveDate::from_ymd_opt(year, tm.mon as u32, tm.day as u32)
        .expect("valid calendar date")
        .and_hms_opt(tm.hour as u32, tm.min as u32, tm.sec as u32)
        .expect("valid time of day")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tm_elements_round_trip() {
        let dt = NaiveDate::from_ymd_opt(2026, 7, 26)
            .unwrap()
            .and_hms_opt(13, 5, 9)
            .unwrap();
        let tm = rtc_break(&dt);
        assert_eq!(rtc_make(&tm), dt);
    }
}
