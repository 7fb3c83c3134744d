//! MS-DOS packed date/time used by ZIP headers
//!
//! Packed layout: `(year-1980)<<25 | month<<21 | day<<16 | hour<<11 |
//! minute<<5 | second/2`, stored as two little-endian u16 fields (time low,
//! date high). Decoding clamps components into a valid calendar range and
//! never fails; malformed input simply yields some defined moment.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// Pack a timestamp into `(dos_time, dos_date)`.
///
/// Years outside 1980-2107 saturate; seconds lose their low bit.
pub fn to_dos(moment: NaiveDateTime) -> (u16, u16) {
    let year = moment.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | (moment.month() as u16) << 5 | moment.day() as u16;
    let time =
        (moment.hour() as u16) << 11 | (moment.minute() as u16) << 5 | (moment.second() as u16) / 2;
    (time, date)
}

/// Decode `(dos_time, dos_date)` into a timestamp, clamping each component.
pub fn from_dos(time: u16, date: u16) -> NaiveDateTime {
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F).clamp(1, 12) as u32;
    let day = (date & 0x1F).clamp(1, 31) as u32;
    let hour = ((time >> 11) & 0x1F).min(23) as u32;
    let minute = ((time >> 5) & 0x3F).min(59) as u32;
    let second = ((time & 0x1F) * 2).min(59) as u32;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 1))
        .unwrap_or_default();
    date.and_hms_opt(hour, minute, second)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_even_seconds() {
        let moment = NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_opt(13, 45, 8)
            .unwrap();
        let (time, date) = to_dos(moment);
        assert_eq!(from_dos(time, date), moment);
    }

    #[test]
    fn odd_seconds_round_down() {
        let moment = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 9)
            .unwrap();
        let (time, date) = to_dos(moment);
        assert_eq!(from_dos(time, date).second(), 8);
    }

    #[test]
    fn year_saturates_at_1980() {
        let moment = NaiveDate::from_ymd_opt(1975, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let (_, date) = to_dos(moment);
        assert_eq!(1980 + (date >> 9) as i32, 1980);
    }

    #[test]
    fn malformed_fields_clamp_instead_of_failing() {
        // month 0, day 0, hour 31
        let decoded = from_dos(31 << 11, 0);
        assert_eq!(decoded.month(), 1);
        assert_eq!(decoded.day(), 1);
        assert_eq!(decoded.hour(), 23);
        // day 31 in a 30-day month falls back to the 1st
        let decoded = from_dos(0, (44 << 9) | (4 << 5) | 31);
        assert_eq!(decoded.month(), 4);
        assert_eq!(decoded.day(), 1);
    }
}
