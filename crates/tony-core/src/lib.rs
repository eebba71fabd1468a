pub mod config;
pub mod records;

pub use config::{ConfigError, MemoryConfig, RemoteConfig};
pub use records::{
    ChatMessage, EpisodicRecord, MessageType, ProceduralRecord, RecordKind, SemanticRecord,
    SessionMetadata, SessionSnapshot,
};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 so lexical order in SQLite matches chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|timestamp| timestamp.with_timezone(&Utc))
}

/// Truncates to `max_chars` characters, never splitting a code point.
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc
            .with_ymd_and_hms(2026, 2, 23, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(
            parse_timestamp(&format_timestamp(late)).expect("parse"),
            late
        );
    }

    #[test]
    fn truncate_chars_respects_multibyte_text() {
        assert_eq!(truncate_chars("vacaciónes", 7), "vacació");
        assert_eq!(truncate_chars("corto", 50), "corto");
    }
}
