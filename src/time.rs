use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

/// Wall-clock format sensors use in their CSV reports.
const REPORT_LOCAL_FORMATS: [&str; 2] = ["%Y/%m/%d %H:%M:%S", "%Y/%m/%d %H:%M"];
/// Format of the `time_start` / `time_end` request parameters.
pub const WINDOW_PARAM_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Zone a sensor reports local time in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Default for SensorZone {
    fn default() -> Self {
        Self::Named(Tz::UTC)
    }
}

impl SensorZone {
    /// Accepts IANA names (`Asia/Tokyo`) and fixed offsets (`+09:00`,
    /// `UTC-05:00`, `-0330`).
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(tz) = trimmed.parse::<Tz>() {
            return Some(Self::Named(tz));
        }
        parse_fixed_offset(trimmed).map(Self::Fixed)
    }

    /// Declared zone if it parses, otherwise the fallback.
    pub fn resolve(declared: Option<&str>, fallback: SensorZone) -> Self {
        match declared.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => Self::parse(raw).unwrap_or_else(|| {
                tracing::warn!(zone = raw, "unrecognised sensor timezone; using default");
                fallback
            }),
            None => fallback,
        }
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Named(tz) => instant.with_timezone(tz).naive_local(),
            Self::Fixed(offset) => instant.with_timezone(offset).naive_local(),
        }
    }

    /// Every UTC instant the local wall-clock time can denote. Empty inside a
    /// DST gap, two entries inside a DST overlap.
    fn candidates(&self, local: NaiveDateTime) -> Vec<DateTime<Utc>> {
        match self {
            Self::Named(tz) => local_candidates(tz, local),
            Self::Fixed(offset) => local_candidates(offset, local),
        }
    }

    /// Offset east of UTC in effect at the given instant.
    pub fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        match self {
            Self::Named(tz) => tz.offset_from_utc_datetime(&instant.naive_utc()).fix(),
            Self::Fixed(offset) => *offset,
        }
    }
}

fn local_candidates<Z: TimeZone>(zone: &Z, local: NaiveDateTime) -> Vec<DateTime<Utc>> {
    match zone.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) => vec![dt.with_timezone(&Utc)],
        chrono::LocalResult::Ambiguous(a, b) => {
            let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
            if a <= b {
                vec![a, b]
            } else {
                vec![b, a]
            }
        }
        chrono::LocalResult::None => Vec::new(),
    }
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let upper = raw.to_ascii_uppercase();
    let body = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    let (sign, digits) = match body.chars().next()? {
        '+' => (1, &body[1..]),
        '-' => (-1, &body[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn parse_report_local(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    REPORT_LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("local time falls in a DST gap")]
    Nonexistent,
    #[error("interval end is not after its start")]
    NotIncreasing,
}

/// Converts a sensor-local interval to UTC.
///
/// Local wall-clock time minus the zone's UTC offset gives UTC: 10:00 at
/// `+09:00` is 01:00Z, 10:00 at `-05:00` is 15:00Z. When DST makes either bound
/// ambiguous, the pair whose elapsed time best matches the wall-clock duration
/// wins, ties going to the earlier instants.
pub fn resolve_local_interval(
    zone: &SensorZone,
    start_local: NaiveDateTime,
    end_local: NaiveDateTime,
) -> Result<(DateTime<Utc>, DateTime<Utc>), IntervalError> {
    if end_local <= start_local {
        return Err(IntervalError::NotIncreasing);
    }
    let starts = zone.candidates(start_local);
    let ends = zone.candidates(end_local);
    if starts.is_empty() || ends.is_empty() {
        return Err(IntervalError::Nonexistent);
    }

    let expected = end_local - start_local;
    let mut best: Option<(DateTime<Utc>, DateTime<Utc>, i64)> = None;
    for start in &starts {
        for end in &ends {
            let elapsed = *end - *start;
            if elapsed <= Duration::zero() {
                continue;
            }
            let diff = (elapsed - expected).num_seconds().abs();
            let better = match best {
                None => true,
                Some((best_start, best_end, best_diff)) => {
                    diff < best_diff || (diff == best_diff && (*start, *end) < (best_start, best_end))
                }
            };
            if better {
                best = Some((*start, *end, diff));
            }
        }
    }

    best.map(|(start, end, _)| (start, end))
        .ok_or(IntervalError::NotIncreasing)
}

pub fn format_window_param(zone: &SensorZone, instant: DateTime<Utc>) -> String {
    zone.to_local(instant).format(WINDOW_PARAM_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn east_of_utc_local_time_is_ahead_of_utc() {
        let zone = SensorZone::parse("Asia/Tokyo").unwrap();
        let (start, end) =
            resolve_local_interval(&zone, local(2024, 1, 15, 10, 0), local(2024, 1, 15, 10, 15))
                .unwrap();
        assert_eq!(start, utc(2024, 1, 15, 1, 0));
        assert_eq!(end, utc(2024, 1, 15, 1, 15));
    }

    #[test]
    fn west_of_utc_local_time_is_behind_utc() {
        let zone = SensorZone::parse("-05:00").unwrap();
        let (start, _) =
            resolve_local_interval(&zone, local(2024, 1, 15, 22, 0), local(2024, 1, 15, 22, 15))
                .unwrap();
        assert_eq!(start, utc(2024, 1, 16, 3, 0));
    }

    #[test]
    fn conversion_direction_matches_offset_for_every_fixture_zone() {
        let fixture = local(2024, 6, 1, 12, 0);
        for raw in ["+09:00", "UTC+05:30", "-0800", "Europe/Berlin", "America/New_York", "UTC"] {
            let zone = SensorZone::parse(raw).unwrap();
            let (start, _) =
                resolve_local_interval(&zone, fixture, fixture + Duration::minutes(15)).unwrap();
            let offset = zone.offset_at(start).local_minus_utc() as i64;
            assert_eq!(
                start.naive_utc(),
                fixture - Duration::seconds(offset),
                "zone {raw}"
            );
        }
    }

    #[test]
    fn dst_gap_is_rejected() {
        let zone = SensorZone::parse("America/New_York").unwrap();
        let err =
            resolve_local_interval(&zone, local(2024, 3, 10, 2, 15), local(2024, 3, 10, 2, 30))
                .unwrap_err();
        assert_eq!(err, IntervalError::Nonexistent);
    }

    #[test]
    fn dst_overlap_prefers_pair_matching_wall_clock_duration() {
        let zone = SensorZone::parse("America/New_York").unwrap();
        let (start, end) =
            resolve_local_interval(&zone, local(2024, 11, 3, 1, 0), local(2024, 11, 3, 1, 15))
                .unwrap();
        assert_eq!(end - start, Duration::minutes(15));
        assert_eq!(start, utc(2024, 11, 3, 5, 0));
    }

    #[test]
    fn unknown_zone_falls_back() {
        let fallback = SensorZone::parse("+02:00").unwrap();
        assert_eq!(SensorZone::resolve(Some("Mars/Olympus"), fallback), fallback);
        assert_eq!(SensorZone::resolve(None, fallback), fallback);
        assert_eq!(
            SensorZone::resolve(Some(" Asia/Tokyo "), fallback),
            SensorZone::Named(Tz::Asia__Tokyo)
        );
    }

    #[test]
    fn window_params_are_rendered_in_sensor_local_time() {
        let zone = SensorZone::parse("+09:00").unwrap();
        assert_eq!(
            format_window_param(&zone, utc(2024, 1, 15, 1, 0)),
            "2024-01-15-10:00:00"
        );
    }

    #[test]
    fn report_timestamps_accept_optional_seconds() {
        assert_eq!(
            parse_report_local("2024/01/15 10:00:00"),
            Some(local(2024, 1, 15, 10, 0))
        );
        assert_eq!(parse_report_local("2024/01/15 10:00"), Some(local(2024, 1, 15, 10, 0)));
        assert_eq!(parse_report_local("15-01-2024"), None);
    }
}
