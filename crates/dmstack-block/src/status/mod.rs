//! Status line decoding
//!
//! Kernel status output is positional: `<start> <length> <type> <params...>`.
//! Each target type has a record implementing [`TargetStatus`] that consumes
//! the params in a fixed order through a [`StatusCursor`]. A decode either
//! yields a complete record, yields [`DeviceStatus::Failed`] when the target
//! reports `Fail` or `Error`, or returns a [`ParseError`].

pub mod cache;
pub mod clone;
pub mod cursor;
pub mod thin_pool;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

pub use cache::CacheStatus;
pub use clone::CloneStatus;
pub use cursor::{MetadataMode, StatusCursor};
pub use thin_pool::{NoSpacePolicy, PoolMode, ThinPoolStatus};

/// Failure sentinel reported in place of a status record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Fail,
    Error,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Fail => write!(f, "Fail"),
            FailureKind::Error => write!(f, "Error"),
        }
    }
}

/// Decoded status: a full record or the failure marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus<T> {
    Working(T),
    Failed(FailureKind),
}

impl<T> DeviceStatus<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeviceStatus::Failed(_))
    }

    /// The record, unless the target failed
    pub fn working(&self) -> Option<&T> {
        match self {
            DeviceStatus::Working(record) => Some(record),
            DeviceStatus::Failed(_) => None,
        }
    }

    pub fn into_working(self) -> Option<T> {
        match self {
            DeviceStatus::Working(record) => Some(record),
            DeviceStatus::Failed(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for DeviceStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Working(record) => record.fmt(f),
            DeviceStatus::Failed(kind) => kind.fmt(f),
        }
    }
}

/// Status record schema for one target type
pub trait TargetStatus: Sized {
    /// Target type name as it appears in status lines
    const TARGET_TYPE: &'static str;

    /// Consume the fields in kernel order
    fn decode(cursor: &mut StatusCursor<'_>) -> Result<Self, ParseError>;
}

/// Decode the params part of a status line
pub fn decode<T: TargetStatus>(params: &str) -> Result<DeviceStatus<T>, ParseError> {
    let mut cursor = StatusCursor::new(params);
    if let Some(kind) = cursor.failure_sentinel() {
        return Ok(DeviceStatus::Failed(kind));
    }
    let record = T::decode(&mut cursor)?;
    cursor.finish(T::TARGET_TYPE)?;
    Ok(DeviceStatus::Working(record))
}

/// Decode a full single-target status line, checking its target type
pub fn decode_line<T: TargetStatus>(line: &str) -> Result<DeviceStatus<T>, ParseError> {
    let line = StatusLine::parse(line)?;
    if line.target_type != T::TARGET_TYPE {
        if let Some(kind) = StatusCursor::new(&line.target_type).failure_sentinel() {
            return Ok(DeviceStatus::Failed(kind));
        }
        return Err(ParseError::TargetMismatch {
            expected: T::TARGET_TYPE,
            found: line.target_type,
        });
    }
    decode(&line.params)
}

/// Header fields of one status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub start: u64,
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

impl StatusLine {
    /// Split `<start> <length> <type> <params...>`
    ///
    /// Input holding more than one non-empty line is rejected; multi-target
    /// devices must be decoded line by line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedLine {
            line: line.to_string(),
        };

        let mut lines = line.lines().filter(|l| !l.trim().is_empty());
        let text = lines.next().ok_or_else(malformed)?;
        if lines.next().is_some() {
            return Err(malformed());
        }

        let mut parts = text.split_whitespace();
        let start = parts.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
        let length = parts.next().and_then(|t| t.parse().ok()).ok_or_else(malformed)?;
        let target_type = parts.next().ok_or_else(malformed)?.to_string();
        let params = parts.collect::<Vec<_>>().join(" ");

        Ok(Self {
            start,
            length,
            target_type,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_parse() {
        let line = StatusLine::parse("0 2097152 clone 8 1/2 rw\n").unwrap();
        assert_eq!(line.start, 0);
        assert_eq!(line.length, 2097152);
        assert_eq!(line.target_type, "clone");
        assert_eq!(line.params, "8 1/2 rw");

        let bare = StatusLine::parse("0 8 linear").unwrap();
        assert_eq!(bare.params, "");

        assert!(matches!(
            StatusLine::parse("zero 8 clone"),
            Err(ParseError::MalformedLine { .. })
        ));
        assert!(matches!(
            StatusLine::parse("0 8 linear\n8 8 linear"),
            Err(ParseError::MalformedLine { .. })
        ));
        assert!(StatusLine::parse("   ").is_err());
    }

    #[test]
    fn test_sentinels_win_over_anything() {
        for tail in ["", " garbage", " 1 2 3 x/y"] {
            let fail = decode::<CloneStatus>(&format!("Fail{tail}")).unwrap();
            assert_eq!(fail, DeviceStatus::Failed(FailureKind::Fail));
            let err = decode::<CacheStatus>(&format!("Error{tail}")).unwrap();
            assert_eq!(err, DeviceStatus::Failed(FailureKind::Error));
            let pool = decode::<ThinPoolStatus>(&format!("Fail{tail}")).unwrap();
            assert!(pool.is_failed());
        }
    }

    #[test]
    fn test_decode_line_checks_type() {
        let err = decode_line::<CloneStatus>("0 8 cache 1 2 3").unwrap_err();
        assert_eq!(
            err,
            ParseError::TargetMismatch {
                expected: "clone",
                found: "cache".into()
            }
        );

        let failed = decode_line::<CloneStatus>("0 8 clone Fail").unwrap();
        assert_eq!(failed, DeviceStatus::Failed(FailureKind::Fail));
    }
}
