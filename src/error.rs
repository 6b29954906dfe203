//! Error types for hugenvme.

use std::fmt;
use std::time::Duration;

/// Result type for hugenvme operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hugenvme operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The allocator could not hand out a region of the requested size.
    #[error("failed to allocate {size} bytes: {reason}")]
    Allocation { size: usize, reason: String },

    /// Buffer is unknown to this allocator or was already released.
    #[error("invalid buffer handle {0}")]
    InvalidHandle(u64),

    /// No free submission slot on the queue pair.
    #[error("queue {queue} is full")]
    QueueFull { queue: u16 },

    /// Block range is empty, too large for one command or past the namespace end.
    #[error("invalid range: lba {lba}, {blocks} blocks ({reason})")]
    InvalidRange {
        lba: u64,
        blocks: u64,
        reason: &'static str,
    },

    /// Buffer cannot hold the requested transfer.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Byte offset or size is not a multiple of the logical block size.
    #[error("offset {offset} / size {size} not aligned to {block_size} byte blocks")]
    Misaligned {
        offset: u64,
        size: usize,
        block_size: u64,
    },

    /// Controller bring-up was rejected by the device.
    #[error("controller initialization failed: {0}")]
    ControllerInit(String),

    /// A live driver already owns this device.
    #[error("controller {0} is already initialized")]
    AlreadyInitialized(String),

    /// Teardown requested while commands are still in flight.
    #[error("{outstanding} command(s) still outstanding")]
    QueuesNotDrained { outstanding: usize },

    /// The device completed the command with an error status.
    #[error("command failed: {}", StatusCode::from(*status_code))]
    Io { status_code: u16 },

    /// No completion arrived before the deadline.
    #[error("no completion after {0:?}")]
    IoTimeout(Duration),

    /// Buffer is referenced by an outstanding command.
    #[error("buffer {0} is referenced by an outstanding command")]
    BufferBusy(u64),

    /// The driver was already finalized.
    #[error("controller is not initialized")]
    NotInitialized,

    /// Configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// OS level failure (sysfs, mmap, pagemap).
    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),
}

impl Error {
    /// Decoded NVMe status for [`Error::Io`].
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Io { status_code } => Some(StatusCode::from(*status_code)),
            _ => None,
        }
    }

    /// Resource exhaustion the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull { .. } | Error::Allocation { .. })
    }
}

/// NVMe completion status field (phase tag stripped).
///
/// Bits 7:0 are the status code, 10:8 the status code type, 14 more and
/// 15 do-not-retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

pub const SCT_GENERIC: u8 = 0;
pub const SCT_COMMAND_SPECIFIC: u8 = 1;
pub const SCT_MEDIA: u8 = 2;

impl StatusCode {
    pub fn new(sct: u8, sc: u8) -> Self {
        Self(((sct as u16 & 0x7) << 8) | sc as u16)
    }

    pub fn sc(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn sct(&self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    pub fn do_not_retry(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn is_success(&self) -> bool {
        self.sc() == 0 && self.sct() == 0
    }

    pub fn description(&self) -> &'static str {
        match (self.sct(), self.sc()) {
            (SCT_GENERIC, 0x00) => "successful completion",
            (SCT_GENERIC, 0x01) => "invalid command opcode",
            (SCT_GENERIC, 0x02) => "invalid field in command",
            (SCT_GENERIC, 0x04) => "data transfer error",
            (SCT_GENERIC, 0x06) => "internal error",
            (SCT_GENERIC, 0x0b) => "invalid namespace or format",
            (SCT_GENERIC, 0x80) => "lba out of range",
            (SCT_GENERIC, 0x81) => "capacity exceeded",
            (SCT_COMMAND_SPECIFIC, 0x01) => "invalid queue identifier",
            (SCT_COMMAND_SPECIFIC, 0x02) => "invalid queue size",
            (SCT_MEDIA, 0x80) => "write fault",
            (SCT_MEDIA, 0x81) => "unrecovered read error",
            _ => "unknown status",
        }
    }
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (sct {:#x}, sc {:#04x})",
            self.description(),
            self.sct(),
            self.sc()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_fields() {
        let status = StatusCode::new(SCT_MEDIA, 0x81);
        assert_eq!(status.sct(), SCT_MEDIA);
        assert_eq!(status.sc(), 0x81);
        assert!(!status.is_success());
        assert!(!status.do_not_retry());
        assert_eq!(status.description(), "unrecovered read error");
    }

    #[test]
    fn io_error_display_names_status() {
        let err = Error::Io {
            status_code: StatusCode::new(SCT_GENERIC, 0x80).0,
        };
        let msg = err.to_string();
        assert!(msg.contains("lba out of range"));
        assert_eq!(err.status().map(|s| s.sc()), Some(0x80));
    }

    #[test]
    fn resource_errors_are_retryable() {
        assert!(Error::QueueFull { queue: 1 }.is_retryable());
        assert!(Error::Allocation {
            size: 512,
            reason: "pool exhausted".into()
        }
        .is_retryable());
        assert!(!Error::IoTimeout(Duration::from_millis(1)).is_retryable());
        assert!(!Error::Misaligned {
            offset: 0,
            size: 500,
            block_size: 512
        }
        .is_retryable());
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error + Send + Sync + 'static>() {}
        assert_std_error::<Error>();
    }
}
