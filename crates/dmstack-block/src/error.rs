//! Error types
//!
//! One enum per failure family (allocation, table construction, status
//! decoding, control plane, process execution) folded into [`DmError`].

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the crate
pub type DmResult<T> = Result<T, DmError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum DmError {
    /// Extent allocation failed
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// A table or target descriptor is malformed
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// The kernel refused to activate a table
    #[error("Activation of {device} failed ({kind}): {reason}")]
    Activation {
        device: String,
        kind: ActivationFailure,
        reason: String,
    },

    /// A status line could not be decoded
    #[error("Status parse error: {0}")]
    Parse(#[from] ParseError),

    /// A condition wait ran past its deadline
    #[error(
        "Deadline of {timeout:?} exceeded waiting on {device} (last status: {})",
        last_status.as_deref().unwrap_or("<none>")
    )]
    DeadlineExceeded {
        device: String,
        timeout: Duration,
        last_status: Option<String>,
    },

    /// A target reported `Fail` or `Error` while waiting on it
    #[error("Target {device} reported {kind}")]
    TargetFailed {
        device: String,
        kind: crate::status::FailureKind,
    },

    /// A target rejected a control message
    #[error("Device {device} rejected message '{message}': {reason}")]
    MessageRejected {
        device: String,
        message: String,
        reason: String,
    },

    /// Operation not valid in the handle's current lifecycle state
    #[error("Invalid state for {operation} on {device}: expected {expected}, found {found}")]
    InvalidState {
        device: String,
        operation: &'static str,
        expected: String,
        found: String,
    },

    /// No device with this role in a stack
    #[error("Unknown device role: {0}")]
    UnknownRole(String),

    /// Any other control plane failure (remove, suspend, resume, status)
    #[error("Control plane {operation} failed on {device}: {reason}")]
    Control {
        operation: &'static str,
        device: String,
        reason: String,
    },

    /// External process failure
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DmError {
    /// Activation failure kind, if this is an activation error
    pub fn activation_failure(&self) -> Option<ActivationFailure> {
        match self {
            DmError::Activation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Last raw status observed before a deadline expired
    pub fn last_status(&self) -> Option<&str> {
        match self {
            DmError::DeadlineExceeded { last_status, .. } => last_status.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn control(operation: &'static str, device: &str, err: ControlError) -> Self {
        DmError::Control {
            operation,
            device: device.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Why the kernel refused a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFailure {
    /// Invalid arguments or kernel-side constraint violated
    Rejected,
    /// Existing on-disk metadata disagrees with the requested geometry
    Incompatible,
}

impl fmt::Display for ActivationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationFailure::Rejected => write!(f, "rejected"),
            ActivationFailure::Incompatible => write!(f, "incompatible metadata"),
        }
    }
}

/// Extent allocator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// No backing device to allocate from
    #[error("no allocation volume registered")]
    NoAllocationVolume,

    /// A backing device was already set
    #[error("allocation volume already registered: {0}")]
    AlreadyRegistered(String),

    /// Volume names are unique per allocator
    #[error("volume '{0}' already exists")]
    DuplicateVolume(String),

    /// No volume with this name
    #[error("unknown volume '{0}'")]
    UnknownVolume(String),

    /// Volumes must span at least one sector
    #[error("volume '{0}' would have zero length")]
    ZeroLength(String),

    /// Free space after the last extent is too small
    #[error("insufficient space for '{name}': requested {requested} sectors, {available} available")]
    InsufficientSpace {
        name: String,
        requested: u64,
        available: u64,
    },

    /// Only the last extent on a device can be resized
    #[error("volume '{name}' is followed by '{next}' and cannot be resized")]
    NotTerminal { name: String, next: String },
}

/// Malformed target descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Target line without a type
    #[error("target type is empty")]
    EmptyTargetType,

    /// Targets must span at least one sector
    #[error("{target_type} target has zero length")]
    ZeroLength { target_type: String },

    /// Wrong number of positional arguments
    #[error("{target_type} target takes {expected} arguments, got {found}")]
    Arity {
        target_type: String,
        expected: String,
        found: usize,
    },

    /// An argument would split or vanish in the rendered table
    #[error("{target_type} argument '{arg}' is empty or contains whitespace")]
    InvalidArgument { target_type: String, arg: String },

    /// A table needs at least one target line
    #[error("table has no targets")]
    EmptyTable,

    /// Region or block size of zero
    #[error("{target_type} block size is zero")]
    ZeroBlockSize { target_type: String },
}

impl DescriptorError {
    /// Reject a zero region or block size before it is used as a divisor
    pub fn check_block_size(target_type: &str, block_size: u64) -> Result<(), Self> {
        if block_size == 0 {
            return Err(DescriptorError::ZeroBlockSize {
                target_type: target_type.to_string(),
            });
        }
        Ok(())
    }
}

/// Status decoding errors
///
/// Every variant names the field being read and the raw tokens left in the
/// stream at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The line ended before `field`
    #[error("status truncated reading {field} (remaining: '{remaining}')")]
    Truncated { field: &'static str, remaining: String },

    /// Token is not an unsigned integer
    #[error("invalid integer '{token}' for {field} (remaining: '{remaining}')")]
    InvalidInteger {
        field: &'static str,
        token: String,
        remaining: String,
    },

    /// Expected `<used>/<total>`
    #[error("invalid ratio '{token}' for {field} (remaining: '{remaining}')")]
    InvalidRatio {
        field: &'static str,
        token: String,
        remaining: String,
    },

    /// A key/value group with an odd count
    #[error("odd number of {field} arguments: {count} (remaining: '{remaining}')")]
    OddPairCount {
        field: &'static str,
        count: u64,
        remaining: String,
    },

    /// Metadata or pool mode outside the known set
    #[error("unknown mode '{token}' for {field} (remaining: '{remaining}')")]
    UnknownMode {
        field: &'static str,
        token: String,
        remaining: String,
    },

    /// Token does not match the keyword the format requires
    #[error("unexpected '{token}' for {field}, expected {expected} (remaining: '{remaining}')")]
    UnexpectedToken {
        field: &'static str,
        token: String,
        expected: &'static str,
        remaining: String,
    },

    /// Tokens left after a complete record
    #[error("trailing tokens after {target} status: '{remaining}'")]
    TrailingTokens { target: &'static str, remaining: String },

    /// The line belongs to a different target type
    #[error("expected {expected} status, got {found}")]
    TargetMismatch { expected: &'static str, found: String },

    /// Missing the `<start> <length> <type>` prefix
    #[error("malformed status line '{line}'")]
    MalformedLine { line: String },
}

impl ParseError {
    /// Field being decoded when the error was raised
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ParseError::Truncated { field, .. }
            | ParseError::InvalidInteger { field, .. }
            | ParseError::InvalidRatio { field, .. }
            | ParseError::OddPairCount { field, .. }
            | ParseError::UnknownMode { field, .. }
            | ParseError::UnexpectedToken { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Control plane failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlErrorKind {
    /// Table or message refused as invalid
    Rejected,
    /// Existing metadata disagrees with the table
    Incompatible,
    /// No such device
    NotFound,
    /// Anything else (busy, I/O, tool failure)
    Failed,
}

impl fmt::Display for ControlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlErrorKind::Rejected => write!(f, "rejected"),
            ControlErrorKind::Incompatible => write!(f, "incompatible"),
            ControlErrorKind::NotFound => write!(f, "not found"),
            ControlErrorKind::Failed => write!(f, "failed"),
        }
    }
}

/// Error reported by a [`crate::control::ControlPlane`] backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {reason}")]
pub struct ControlError {
    pub kind: ControlErrorKind,
    pub reason: String,
}

impl ControlError {
    pub fn new(kind: ControlErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::Rejected, reason)
    }

    pub fn incompatible(reason: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::Incompatible, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::NotFound, reason)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::Failed, reason)
    }
}

/// External process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Non-zero exit or killed by a signal
    #[error("'{command}' exited with {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Output that could not be interpreted
    #[error("unexpected output from '{command}': {output}")]
    BadOutput { command: String, output: String },
}
