#![forbid(unsafe_code)]

use chrono::{DateTime, Local, TimeZone};

/// SIP2 date/time layout: `YYYYMMDD` + four-character zone + `HHMMSS`.
const SIP2_TIMESTAMP_FORMAT: &str = "%Y%m%d    %H%M%S";

/// Format `at` as an 18-character SIP2 timestamp (blank zone means local time).
pub fn sip2_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
	Tz::Offset: std::fmt::Display,
{
	at.format(SIP2_TIMESTAMP_FORMAT).to_string()
}

#[inline]
pub fn sip2_now() -> String {
	sip2_timestamp(&Local::now())
}
