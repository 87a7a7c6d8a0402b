use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

pub const DEFAULT_LATE_AFTER_MINUTES: i64 = 15;
pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 60;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),
    #[error("unknown attendance status: {0}")]
    UnknownStatus(String),
    #[error("utc offset out of range: {0} minutes")]
    BadOffset(i64),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        "bad_params"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    /// Anything other than `expired` is treated as still open, including a
    /// null status on imported rows.
    pub fn from_stored(s: Option<&str>) -> Self {
        match s {
            Some(v) if v.eq_ignore_ascii_case("expired") => Self::Expired,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
    Excused,
    Absent,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [
        AttendanceStatus::Present,
        AttendanceStatus::Late,
        AttendanceStatus::Excused,
        AttendanceStatus::Absent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Excused => "excused",
            Self::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SessionError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "late" => Ok(Self::Late),
            "excused" => Ok(Self::Excused),
            "absent" => Ok(Self::Absent),
            _ => Err(SessionError::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMethod {
    Qr,
    Manual,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Manual => "manual",
        }
    }
}

pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339 as well as the bare `YYYY-MM-DD HH:MM:SS` form, which is
/// read as UTC.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SessionError> {
    let t = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(SessionError::InvalidTimestamp(raw.to_string()))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, SessionError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| SessionError::InvalidDate(raw.to_string()))
}

pub fn effective_status(
    stored: SessionStatus,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SessionStatus {
    if stored == SessionStatus::Expired || expires_at < now {
        SessionStatus::Expired
    } else {
        SessionStatus::Active
    }
}

/// True when a row still marked active has outlived its expiry and must be
/// flipped on this read.
pub fn needs_expiry_transition(
    stored: SessionStatus,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    stored == SessionStatus::Active && expires_at < now
}

/// Whole minutes since the session opened decide present vs late; the
/// boundary minute itself still counts as present.
pub fn classify_check_in(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    late_after_minutes: i64,
) -> AttendanceStatus {
    let elapsed = (now - created_at).num_minutes().max(0);
    if elapsed <= late_after_minutes {
        AttendanceStatus::Present
    } else {
        AttendanceStatus::Late
    }
}

pub fn expiry_from_ttl(now: DateTime<Utc>, ttl_minutes: i64) -> DateTime<Utc> {
    now + Duration::minutes(ttl_minutes)
}

fn offset(offset_minutes: i64) -> Result<FixedOffset, SessionError> {
    i32::try_from(offset_minutes * 60)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or(SessionError::BadOffset(offset_minutes))
}

pub fn local_date(now: DateTime<Utc>, offset_minutes: i64) -> Result<NaiveDate, SessionError> {
    Ok(now.with_timezone(&offset(offset_minutes)?).date_naive())
}

/// UTC bounds `[start, end)` of a calendar day in the configured offset.
pub fn day_window_utc(
    date: NaiveDate,
    offset_minutes: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>), SessionError> {
    let tz = offset(offset_minutes)?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| SessionError::InvalidDate(date.to_string()))?;
    let start = tz
        .from_local_datetime(&midnight)
        .single()
        .ok_or_else(|| SessionError::InvalidDate(date.to_string()))?
        .with_timezone(&Utc);
    Ok((start, start + Duration::days(1)))
}

fn encode_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ' ' => out.push_str("%20"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            _ => out.push(ch),
        }
    }
    out
}

/// Payload encoded into the session QR code.
pub fn check_in_url(base_url: &str, section_name: &str, session_id: &str) -> String {
    format!(
        "{}/attendance/{}/{}",
        base_url.trim_end_matches('/'),
        encode_path_segment(section_name),
        session_id
    )
}
