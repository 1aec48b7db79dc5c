//! Return codes and the crate error type.
//!
//! Vendor adapters report status through a bit-encoded [`ReturnCode`]:
//!
//! ```text
//!  31   30..16   15..12   11..5    4..0
//! +---+--------+--------+--------+-------+
//! | F | unused | class  | codec  |  sub  |
//! +---+--------+--------+--------+-------+
//! ```
//!
//! `F` is the severity bit (set = fatal). Fatal codes abort the enclosing
//! command and surface as [`Error`]; non-fatal codes are logged and absorbed.

use core::fmt;

use crate::adapter::ApiCmd;
use crate::message::{ComponentId, Opcode};

const FATAL_BIT: u32 = 0x8000_0000;
const CLASS_SHIFT: u32 = 12;
const CLASS_MASK: u32 = 0xf;
const CODEC_SHIFT: u32 = 5;
const CODEC_MASK: u32 = 0x7f;
const SUB_MASK: u32 = 0x1f;

/// Severity half of a [`ReturnCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Expected steady-state condition ("no data yet").
    NonFatal,
    /// Aborts the current command or cycle.
    Fatal,
}

/// Error class of a [`ReturnCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad memory allocation/alignment, invalid command, invalid command type.
    Api,
    /// Bad state transition or out-of-range parameter.
    Config,
    /// Bad input or invalid internal state while processing.
    Execute,
    /// Vendor-defined class outside the standard three.
    Other(u8),
}

impl ErrorClass {
    fn from_bits(bits: u32) -> Self {
        match bits & CLASS_MASK {
            0 => ErrorClass::Api,
            1 => ErrorClass::Config,
            2 => ErrorClass::Execute,
            c => ErrorClass::Other(c as u8),
        }
    }
}

/// A bit-encoded status word returned by every vendor adapter call.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(u32);

impl ReturnCode {
    /// Success.
    pub const OK: ReturnCode = ReturnCode(0);

    /// Memory allocation failed or a block is too small.
    pub const API_MEM_ALLOC: ReturnCode = ReturnCode::fatal(ErrorClass::Api, 0);
    /// Memory alignment is invalid.
    pub const API_MEM_ALIGN: ReturnCode = ReturnCode::fatal(ErrorClass::Api, 1);
    /// Command is not recognised.
    pub const API_INVALID_CMD: ReturnCode = ReturnCode::fatal(ErrorClass::Api, 2);
    /// Command index or phase is not recognised.
    pub const API_INVALID_CMD_TYPE: ReturnCode = ReturnCode::fatal(ErrorClass::Api, 3);

    /// Parameter value out of range (or unknown parameter).
    pub const CONFIG_INVALID_PARAM: ReturnCode = ReturnCode::fatal(ErrorClass::Config, 0);
    /// Configuration request not allowed in the current state.
    pub const CONFIG_INVALID_STATE: ReturnCode = ReturnCode::fatal(ErrorClass::Config, 1);

    /// Input data is malformed.
    pub const EXEC_BAD_INPUT: ReturnCode = ReturnCode::fatal(ErrorClass::Execute, 0);
    /// Processing requested in an invalid internal state.
    pub const EXEC_INVALID_STATE: ReturnCode = ReturnCode::fatal(ErrorClass::Execute, 1);
    /// No input data available yet.
    pub const EXEC_NO_DATA: ReturnCode =
        ReturnCode::new(Severity::NonFatal, ErrorClass::Execute, 0, 0);
    /// No output buffer available yet.
    pub const EXEC_NO_OUTPUT: ReturnCode =
        ReturnCode::new(Severity::NonFatal, ErrorClass::Execute, 0, 1);

    /// Build a code from its fields. Out-of-range fields are masked.
    pub const fn new(severity: Severity, class: ErrorClass, codec: u8, sub: u8) -> Self {
        let fatal = match severity {
            Severity::Fatal => FATAL_BIT,
            Severity::NonFatal => 0,
        };
        let class = match class {
            ErrorClass::Api => 0,
            ErrorClass::Config => 1,
            ErrorClass::Execute => 2,
            ErrorClass::Other(c) => c as u32 & CLASS_MASK,
        };
        ReturnCode(
            fatal
                | (class << CLASS_SHIFT)
                | ((codec as u32 & CODEC_MASK) << CODEC_SHIFT)
                | (sub as u32 & SUB_MASK),
        )
    }

    /// Fatal code of the generic codec (id 0).
    pub const fn fatal(class: ErrorClass, sub: u8) -> Self {
        ReturnCode::new(Severity::Fatal, class, 0, sub)
    }

    /// Reinterpret a raw status word.
    pub const fn from_raw(raw: u32) -> Self {
        ReturnCode(raw)
    }

    /// The raw status word.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Tag this code with a vendor codec id.
    pub const fn with_codec(self, codec: u8) -> Self {
        ReturnCode((self.0 & !(CODEC_MASK << CODEC_SHIFT)) | ((codec as u32 & CODEC_MASK) << CODEC_SHIFT))
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_fatal(self) -> bool {
        self.0 & FATAL_BIT != 0
    }

    pub fn severity(self) -> Severity {
        if self.is_fatal() {
            Severity::Fatal
        } else {
            Severity::NonFatal
        }
    }

    pub fn class(self) -> ErrorClass {
        ErrorClass::from_bits(self.0 >> CLASS_SHIFT)
    }

    pub fn codec(self) -> u8 {
        ((self.0 >> CODEC_SHIFT) & CODEC_MASK) as u8
    }

    pub fn subcode(self) -> u8 {
        (self.0 & SUB_MASK) as u8
    }
}

impl fmt::Debug for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("ReturnCode(OK)");
        }
        write!(
            f,
            "ReturnCode({:#010x}: {:?} {:?} codec={} sub={})",
            self.0,
            self.severity(),
            self.class(),
            self.codec(),
            self.subcode()
        )
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Errors surfaced by the runtime.
///
/// Every variant is fatal for the command or cycle it occurs in; the matching
/// [`ReturnCode`] is what travels back on the message response path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A vendor adapter call returned a fatal code.
    #[error("vendor adapter call {cmd:?} failed with {code}")]
    Adapter {
        /// Command that failed.
        cmd: ApiCmd,
        /// Code returned by the adapter.
        code: ReturnCode,
    },

    /// The opcode is valid but not handled by this component type.
    #[error("opcode {0:?} is not supported here")]
    UnsupportedOpcode(Opcode),

    /// A raw opcode value does not map to any handler.
    #[error("invalid opcode value {0:#06x}")]
    InvalidOpcode(u16),

    /// The message addresses a port the component does not have.
    #[error("component has no port {0}")]
    InvalidPort(u8),

    /// Route requested on a port that is already routed.
    #[error("port {0} is already routed")]
    AlreadyRouted(u8),

    /// Unroute requested on a port that is not routed.
    #[error("port {0} is not routed")]
    NotRouted(u8),

    /// No component is registered under this id.
    #[error("no component {0}")]
    UnknownComponent(ComponentId),

    /// Message addressed to a core this runtime does not serve.
    #[error("core {0} is not served by this runtime")]
    ForeignCore(u8),

    /// The request is not valid in the component's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A payload is malformed or truncated.
    #[error("malformed {0} payload")]
    Malformed(&'static str),

    /// A supplied buffer is smaller than the port's transfer length.
    #[error("buffer of {got} bytes is smaller than the required {need}")]
    BufferTooSmall {
        /// Bytes required by the port.
        need: usize,
        /// Bytes supplied.
        got: usize,
    },

    /// Memory request cannot be satisfied.
    #[error("cannot allocate {size} bytes of {what} memory")]
    OutOfMemory {
        /// Memory kind.
        what: &'static str,
        /// Requested size.
        size: usize,
    },

    /// Memory alignment is not a power of two.
    #[error("invalid alignment {0}")]
    BadAlignment(usize),

    /// The port queue is at capacity.
    #[error("port {0} queue is full")]
    QueueFull(u8),

    /// Capture hardware failed to start.
    #[error("capture driver: {0}")]
    Driver(String),
}

impl Error {
    /// Status word reported on the response path for this error.
    pub fn code(&self) -> ReturnCode {
        match self {
            Error::Adapter { code, .. } => *code,
            Error::UnsupportedOpcode(_) | Error::InvalidOpcode(_) | Error::ForeignCore(_) => {
                ReturnCode::API_INVALID_CMD
            }
            Error::InvalidPort(_) | Error::UnknownComponent(_) => ReturnCode::API_INVALID_CMD_TYPE,
            Error::OutOfMemory { .. } | Error::BufferTooSmall { .. } => ReturnCode::API_MEM_ALLOC,
            Error::BadAlignment(_) => ReturnCode::API_MEM_ALIGN,
            Error::AlreadyRouted(_) | Error::NotRouted(_) | Error::InvalidState(_) => {
                ReturnCode::CONFIG_INVALID_STATE
            }
            Error::Malformed(_) => ReturnCode::CONFIG_INVALID_PARAM,
            Error::QueueFull(_) => ReturnCode::EXEC_INVALID_STATE,
            Error::Driver(_) => ReturnCode::EXEC_INVALID_STATE,
        }
    }
}

/// Convenience result type for runtime operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;
