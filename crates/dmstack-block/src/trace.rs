//! Block trace events
//!
//! Captured I/O is reduced to [`TraceEvent`]s: the operation flags from the
//! blktrace RWBS field plus the sector range. Capture itself is provided by
//! a [`BlockTracer`] implementation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::Device;
use crate::error::{DmResult, ParseError};

/// One RWBS flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoOp {
    Read,
    Write,
    Discard,
    Flush,
    Fua,
    Sync,
    Meta,
    ReadAhead,
}

impl IoOp {
    fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'R' => Some(Self::Read),
            'W' => Some(Self::Write),
            'D' => Some(Self::Discard),
            'F' => Some(Self::Flush),
            'S' => Some(Self::Sync),
            'M' => Some(Self::Meta),
            'A' => Some(Self::ReadAhead),
            _ => None,
        }
    }
}

/// Parse an RWBS string such as `WS` or `FWFS`
///
/// A leading `F` is a preflush; an `F` after the data direction marks FUA.
/// `N` means no data and yields an empty set.
pub fn parse_rwbs(rwbs: &str) -> Result<BTreeSet<IoOp>, ParseError> {
    let mut ops = BTreeSet::new();
    let mut seen_direction = false;
    for flag in rwbs.chars() {
        match flag {
            'N' => {}
            'F' if seen_direction => {
                ops.insert(IoOp::Fua);
            }
            other => {
                let op = IoOp::from_flag(other).ok_or_else(|| ParseError::UnexpectedToken {
                    field: "rwbs",
                    token: rwbs.to_string(),
                    expected: "RWBS flags",
                    remaining: rwbs.to_string(),
                })?;
                if matches!(op, IoOp::Read | IoOp::Write | IoOp::Discard) {
                    seen_direction = true;
                }
                ops.insert(op);
            }
        }
    }
    Ok(ops)
}

/// A traced I/O
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ops: BTreeSet<IoOp>,
    /// Start sector
    pub offset: u64,
    /// Length in sectors
    pub length: u64,
}

impl TraceEvent {
    pub fn new(ops: impl IntoIterator<Item = IoOp>, offset: u64, length: u64) -> Self {
        Self {
            ops: ops.into_iter().collect(),
            offset,
            length,
        }
    }

    pub fn is_write(&self) -> bool {
        self.ops.contains(&IoOp::Write)
    }

    /// Parse a completion line from `blkparse` default output
    ///
    /// `<dev> <cpu> <seq> <time> <pid> C <rwbs> <sector> + <len> [<err>]`.
    /// Lines for other actions yield `None`.
    pub fn from_blkparse(line: &str) -> Result<Option<Self>, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[5] != "C" || fields[8] != "+" {
            return Ok(None);
        }

        let int = |field: &'static str, token: &str| {
            token.parse::<u64>().map_err(|_| ParseError::InvalidInteger {
                field,
                token: token.to_string(),
                remaining: line.trim().to_string(),
            })
        };
        Ok(Some(Self {
            ops: parse_rwbs(fields[6])?,
            offset: int("sector", fields[7])?,
            length: int("length", fields[9])?,
        }))
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} + {}", self.ops, self.offset, self.length)
    }
}

/// Keep only events that write
pub fn filter_writes(events: &[TraceEvent]) -> Vec<&TraceEvent> {
    events.iter().filter(|e| e.is_write()).collect()
}

/// True if `events` holds an event equal to `expected`
pub fn contains(events: &[TraceEvent], expected: &TraceEvent) -> bool {
    events.iter().any(|e| e == expected)
}

/// A live capture started by [`BlockTracer::arm`]
pub trait TraceCapture {
    /// Stop tracing and return one event list per traced device
    fn stop(self: Box<Self>) -> DmResult<Vec<Vec<TraceEvent>>>;
}

/// Block trace capture
pub trait BlockTracer {
    /// Start capturing I/O on `devices`
    ///
    /// Must not return until capture is live: I/O issued after `arm`
    /// returns is guaranteed to be recorded.
    fn arm(&self, devices: &[&Device]) -> DmResult<Box<dyn TraceCapture>>;
}

/// Run `body` under a trace of `devices`
///
/// Capture is armed before `body` starts and stopped after it returns,
/// even if it fails. A body error takes precedence over a stop error.
pub fn with_trace<T>(
    tracer: &dyn BlockTracer,
    devices: &[&Device],
    body: impl FnOnce() -> DmResult<T>,
) -> DmResult<(Vec<Vec<TraceEvent>>, T)> {
    let capture = tracer.arm(devices)?;
    let result = body();
    match (result, capture.stop()) {
        (Ok(value), Ok(traces)) => Ok((traces, value)),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(stop_err)) => {
            warn!(error = %stop_err, "failed to stop trace after error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlPlane, SimControlPlane};
    use crate::device::with_dev;
    use crate::error::DmError;
    use crate::table::{LinearTarget, Table, Target};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_parse_rwbs() {
        assert_eq!(
            parse_rwbs("WS").unwrap(),
            [IoOp::Write, IoOp::Sync].into_iter().collect()
        );
        assert_eq!(
            parse_rwbs("FWF").unwrap(),
            [IoOp::Flush, IoOp::Write, IoOp::Fua].into_iter().collect()
        );
        assert!(parse_rwbs("N").unwrap().is_empty());
        assert!(parse_rwbs("WX").is_err());
    }

    #[test]
    fn test_from_blkparse() {
        let line = "253,3    1        7     0.000412345  1234  C  WS 0 + 8 [0]";
        let event = TraceEvent::from_blkparse(line).unwrap().unwrap();
        assert_eq!(event, TraceEvent::new([IoOp::Write, IoOp::Sync], 0, 8));

        let queued = "253,3    1        6     0.000400000  1234  Q  WS 0 + 8 [dd]";
        assert!(TraceEvent::from_blkparse(queued).unwrap().is_none());
    }

    #[test]
    fn test_filter_writes() {
        let events = vec![
            TraceEvent::new([IoOp::Read], 0, 8),
            TraceEvent::new([IoOp::Write], 0, 8),
            TraceEvent::new([IoOp::Write, IoOp::Sync], 8, 8),
        ];
        let writes = filter_writes(&events);
        assert_eq!(writes.len(), 2);
        assert!(contains(&events, &TraceEvent::new([IoOp::Write], 0, 8)));
        assert!(!contains(&events, &TraceEvent::new([IoOp::Write], 16, 8)));
    }

    #[derive(Default)]
    struct Recording {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_stop: bool,
    }

    struct RecordingCapture {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_stop: bool,
    }

    impl TraceCapture for RecordingCapture {
        fn stop(self: Box<Self>) -> DmResult<Vec<Vec<TraceEvent>>> {
            self.log.lock().push("stop");
            if self.fail_stop {
                return Err(DmError::Io(std::io::Error::other("blktrace exited")));
            }
            Ok(vec![vec![TraceEvent::new([IoOp::Write], 0, 8)]])
        }
    }

    impl BlockTracer for Recording {
        fn arm(&self, _devices: &[&Device]) -> DmResult<Box<dyn TraceCapture>> {
            self.log.lock().push("arm");
            Ok(Box::new(RecordingCapture {
                log: self.log.clone(),
                fail_stop: self.fail_stop,
            }))
        }
    }

    #[test]
    fn test_with_trace_arms_first() {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device("/dev/fast", 64);
        let control: Arc<dyn ControlPlane> = sim.clone();
        let table =
            Table::new(Target::from_params(8, &LinearTarget::new("/dev/fast", 0)).unwrap());
        let tracer = Recording::default();

        with_dev(&control, table, |dev| {
            let (traces, ()) = with_trace(&tracer, &[dev], || {
                tracer.log.lock().push("io");
                Ok(())
            })?;
            assert_eq!(traces[0].len(), 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(*tracer.log.lock(), vec!["arm", "io", "stop"]);
    }

    #[test]
    fn test_with_trace_body_error_wins() {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device("/dev/fast", 64);
        let control: Arc<dyn ControlPlane> = sim.clone();
        let table =
            Table::new(Target::from_params(8, &LinearTarget::new("/dev/fast", 0)).unwrap());
        let tracer = Recording {
            fail_stop: true,
            ..Recording::default()
        };

        let err = with_dev(&control, table.clone(), |dev| {
            with_trace(&tracer, &[dev], || -> DmResult<()> {
                Err(DmError::UnknownRole("origin".to_string()))
            })
        })
        .unwrap_err();
        assert!(matches!(err, DmError::UnknownRole(_)));
        assert_eq!(*tracer.log.lock(), vec!["arm", "stop"]);

        let err = with_dev(&control, table, |dev| with_trace(&tracer, &[dev], || Ok(())))
            .unwrap_err();
        assert!(matches!(err, DmError::Io(_)));
    }
}
