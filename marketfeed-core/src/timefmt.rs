//! Timestamp rendering in the reference timezone.
//!
//! Every timestamp that leaves this system is a naive wall-clock string in a
//! single reference zone (Asia/Seoul unless configured otherwise), rendered
//! with second precision as `YYYY-MM-DD HH:MM:SS`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// The one timestamp layout consumers parse.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Normalize a timestamp string to `YYYY-MM-DD HH:MM:SS`.
///
/// - ISO `T` separator becomes a space and anything past 19 chars is dropped
///   (fractional seconds, offsets).
/// - Minute-precision input (16 chars) gets `:00` appended.
/// - Already-normalized input is returned unchanged.
pub fn normalize_timestamp(raw: &str) -> String {
    let mut out = raw.replacen('T', " ", 1);
    if out.chars().count() > 19 {
        out = out.chars().take(19).collect();
    }
    if out.chars().count() == 16 {
        out.push_str(":00");
    }
    out
}

/// The timezone all output timestamps are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone(Tz);

impl Default for ReferenceZone {
    fn default() -> Self {
        Self(chrono_tz::Asia::Seoul)
    }
}

impl ReferenceZone {
    pub fn new(tz: Tz) -> Self {
        Self(tz)
    }

    /// Look up an IANA zone name such as `Asia/Seoul`.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse::<Tz>().ok().map(Self)
    }

    pub fn tz(&self) -> Tz {
        self.0
    }

    /// Render a unix timestamp (seconds) in this zone.
    pub fn format_unix(&self, secs: i64) -> Option<String> {
        DateTime::from_timestamp(secs, 0).map(|dt| self.format(dt))
    }

    pub fn format(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.0).format(TIMESTAMP_FORMAT).to_string()
    }

    /// Current wall-clock time in this zone.
    pub fn now(&self) -> String {
        self.format(Utc::now())
    }

    /// Parse a wall-clock string in this zone into an absolute instant.
    ///
    /// Input goes through [`normalize_timestamp`] first, so minute-precision
    /// and `T`-separated strings are accepted.
    pub fn parse_local(&self, raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(&normalize_timestamp(raw), TIMESTAMP_FORMAT).ok()?;
        self.0
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn minute_precision_gets_seconds() {
        assert_eq!(normalize_timestamp("2025-12-24 00:13"), "2025-12-24 00:13:00");
    }

    #[test]
    fn iso_separator_replaced() {
        assert_eq!(normalize_timestamp("2025-12-24T00:13:56"), "2025-12-24 00:13:56");
    }

    #[test]
    fn iso_with_fraction_and_offset_truncated() {
        assert_eq!(
            normalize_timestamp("2025-12-24T00:13:56.123+09:00"),
            "2025-12-24 00:13:56"
        );
    }

    #[test]
    fn iso_minute_precision() {
        assert_eq!(normalize_timestamp("2025-12-24T00:13"), "2025-12-24 00:13:00");
    }

    #[test]
    fn already_normalized_unchanged() {
        assert_eq!(normalize_timestamp("2025-12-24 00:13:56"), "2025-12-24 00:13:56");
    }

    #[test]
    fn unix_epoch_in_seoul() {
        let zone = ReferenceZone::default();
        assert_eq!(zone.format_unix(0).unwrap(), "1970-01-01 09:00:00");
    }

    #[test]
    fn parse_local_is_inverse_of_format() {
        let zone = ReferenceZone::default();
        let at = zone.parse_local("2025-12-23 06:00:00").unwrap();
        assert_eq!(at.timestamp(), 1_766_437_200);
        assert_eq!(zone.format(at), "2025-12-23 06:00:00");
    }

    #[test]
    fn unknown_zone_rejected() {
        assert!(ReferenceZone::from_name("Mars/Olympus").is_none());
        assert!(ReferenceZone::from_name("America/New_York").is_some());
    }

    proptest! {
        /// Normalization is idempotent and always yields 19 chars for
        /// minute- or second-precision input.
        #[test]
        fn normalize_idempotent(
            y in 2000u32..2100, mo in 1u32..13, d in 1u32..29,
            h in 0u32..24, mi in 0u32..60, s in proptest::option::of(0u32..60),
            iso in any::<bool>(),
        ) {
            let sep = if iso { 'T' } else { ' ' };
            let raw = match s {
                Some(s) => format!("{y:04}-{mo:02}-{d:02}{sep}{h:02}:{mi:02}:{s:02}"),
                None => format!("{y:04}-{mo:02}-{d:02}{sep}{h:02}:{mi:02}"),
            };
            let once = normalize_timestamp(&raw);
            prop_assert_eq!(once.len(), 19);
            prop_assert!(!once.contains('T'));
            prop_assert_eq!(normalize_timestamp(&once), once);
        }
    }
}
