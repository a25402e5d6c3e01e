//! FILETIME and SYSTEMTIME formatting.
//!
//! FILETIME is a count of 100-nanosecond ticks since 1601-01-01T00:00:00Z.
//! The calendar decomposition walks the Gregorian 400/100/4/1-year cycles
//! directly; 1601 is the first year of a 400-year cycle, so no epoch shift
//! is needed. Keeping this local avoids a date dependency and any locale
//! machinery on the render hot path.

use crate::utils::sink::TextSink;

const TICKS_PER_SECOND: u64 = 10_000_000;
const SECONDS_PER_DAY: u64 = 86_400;

const DAYS_PER_400_YEARS: u64 = 146_097;
const DAYS_PER_100_YEARS: u64 = 36_524;
const DAYS_PER_4_YEARS: u64 = 1_461;

const DAYS_IN_MONTH: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

fn is_leap_year(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Decompose a day count since 1601-01-01 into `(year, month, day)`.
fn civil_from_days(mut days: u64) -> (u64, u64, u64) {
    let mut year = 1601_u64;

    year += 400 * (days / DAYS_PER_400_YEARS);
    days %= DAYS_PER_400_YEARS;

    // The last day of a 400-year cycle would otherwise round into a fifth
    // century / year; the caps keep it inside the leap year that owns it.
    let centuries = (days / DAYS_PER_100_YEARS).min(3);
    year += 100 * centuries;
    days -= centuries * DAYS_PER_100_YEARS;

    let quads = days / DAYS_PER_4_YEARS;
    year += 4 * quads;
    days -= quads * DAYS_PER_4_YEARS;

    let years = (days / 365).min(3);
    year += years;
    days -= years * 365;

    let mut month = 0_usize;
    loop {
        let mut in_month = DAYS_IN_MONTH[month];
        if month == 1 && is_leap_year(year) {
            in_month += 1;
        }
        if days < in_month {
            break;
        }
        days -= in_month;
        month += 1;
    }

    (year, month as u64 + 1, days + 1)
}

fn push_date_time(
    out: &mut TextSink,
    year: u64,
    month: u64,
    day: u64,
    hour: u64,
    minute: u64,
    second: u64,
) {
    out.push_decimal_padded(year, 4);
    out.push('-');
    out.push_decimal_padded(month, 2);
    out.push('-');
    out.push_decimal_padded(day, 2);
    out.push('T');
    out.push_decimal_padded(hour, 2);
    out.push(':');
    out.push_decimal_padded(minute, 2);
    out.push(':');
    out.push_decimal_padded(second, 2);
}

/// Append `ticks` as `yyyy-MM-ddTHH:mm:ss.fffffffZ`.
///
/// Zero is a cleared timestamp and renders as nothing at all.
pub(crate) fn push_filetime(ticks: u64, out: &mut TextSink) {
    if ticks == 0 {
        return;
    }

    let seconds = ticks / TICKS_PER_SECOND;
    let fraction = ticks % TICKS_PER_SECOND;

    let days = seconds / SECONDS_PER_DAY;
    let time_of_day = seconds % SECONDS_PER_DAY;
    let (year, month, day) = civil_from_days(days);

    push_date_time(
        out,
        year,
        month,
        day,
        time_of_day / 3600,
        (time_of_day / 60) % 60,
        time_of_day % 60,
    );
    out.push('.');
    out.push_decimal_padded(fraction, 7);
    out.push('Z');
}

/// Format a FILETIME as an owned string.
pub(crate) fn format_filetime(ticks: u64) -> String {
    let mut sink = TextSink::new();
    push_filetime(ticks, &mut sink);
    sink.into_string()
}

/// Append a 16-byte SYSTEMTIME as `yyyy-MM-ddTHH:mm:ss.mmmZ`.
///
/// Layout: eight little-endian u16 fields, in order `year, month, dayOfWeek,
/// day, hour, minute, second, milliseconds`. The day-of-week field is not
/// part of the rendering. Fields are emitted as stored; SYSTEMTIME carries
/// no timezone, so the `Z` mirrors how the values are written by the kernel.
pub(crate) fn push_systemtime(bytes: &[u8; 16], out: &mut TextSink) {
    let field = |i: usize| u64::from(u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]));

    push_date_time(
        out,
        field(0),
        field(1),
        field(3),
        field(4),
        field(5),
        field(6),
    );
    out.push('.');
    out.push_decimal_padded(field(7), 3);
    out.push('Z');
}
