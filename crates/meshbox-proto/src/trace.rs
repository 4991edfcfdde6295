//! Trace-file record format: whitespace-separated `<timestamp_ms> <application> <environment>`.
//!
//! A record with `timestamp_ms == -1` terminates the trace.

use std::fmt;

/// Error parsing a single trace record line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceParseError {
    /// The line did not have exactly three whitespace-separated fields.
    #[error("expected 3 fields, found {0}")]
    WrongFieldCount(usize),
    /// The timestamp field was not a valid integer.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// One parsed line of a trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    /// An arrival at `timestamp_ms` for `application`/`environment`.
    Arrival {
        /// Arrival time, milliseconds since trace start.
        timestamp_ms: i64,
        /// Application tag.
        application: String,
        /// Environment tag.
        environment: String,
    },
    /// The sentinel record (`timestamp_ms == -1`) that terminates the trace.
    End,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arrival {
                timestamp_ms,
                application,
                environment,
            } => write!(f, "{timestamp_ms} {application} {environment}"),
            Self::End => write!(f, "-1 - -"),
        }
    }
}

impl TraceRecord {
    /// Parses one whitespace-separated trace line.
    pub fn parse(line: &str) -> Result<Self, TraceParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(TraceParseError::WrongFieldCount(fields.len()));
        }
        let timestamp_ms: i64 = fields[0]
            .parse()
            .map_err(|_| TraceParseError::InvalidTimestamp(fields[0].to_owned()))?;
        if timestamp_ms == -1 {
            return Ok(Self::End);
        }
        Ok(Self::Arrival {
            timestamp_ms,
            application: fields[1].to_owned(),
            environment: fields[2].to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{TraceParseError, TraceRecord};

    // ── 1. parses a normal arrival line ──
    #[test]
    fn parses_arrival() {
        let record = TraceRecord::parse("0 app0 env0").expect("parse");
        assert_eq!(
            record,
            TraceRecord::Arrival {
                timestamp_ms: 0,
                application: "app0".into(),
                environment: "env0".into(),
            }
        );
    }

    // ── 2. recognizes the -1 sentinel regardless of the other fields ──
    #[test]
    fn parses_end_sentinel() {
        assert_eq!(TraceRecord::parse("-1 - -").expect("parse"), TraceRecord::End);
    }

    // ── 3. rejects malformed lines ──
    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            TraceRecord::parse("0 app0"),
            Err(TraceParseError::WrongFieldCount(2))
        );
    }

    // ── 4. rejects non-integer timestamps ──
    #[test]
    fn rejects_invalid_timestamp() {
        assert!(matches!(
            TraceRecord::parse("soon app0 env0"),
            Err(TraceParseError::InvalidTimestamp(_))
        ));
    }
}
