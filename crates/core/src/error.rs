//! Pipeline error type.
//!
//! Only conditions that stop the pipeline from starting (or a caller-visible
//! I/O step from completing) are errors. Runtime shortfalls such as a failed
//! bank fill, a tripped frame watchdog or a smaller-than-requested cache are
//! handled by degrading and logging, never by returning one of these.

use std::fmt;
use std::io;

/// Fatal or caller-visible pipeline failure.
#[derive(Debug)]
pub enum PipelineError {
    /// The ROM source reported a size of zero bytes.
    EmptyRom,
    /// The ROM source reported a size this platform cannot address.
    RomTooLarge(u64),
    /// Not even a single cache bank (or the bank0 buffer) could be allocated.
    NoCacheBanks,
    /// No native framebuffer could be allocated.
    NoFramebuffer,
    /// The first ROM bank could not be read in full at open time.
    FirstBankUnreadable { expected: usize, got: usize },
    /// Underlying storage error.
    Io(io::Error),
    /// A packed ROM image failed validation.
    InvalidPack(String),
    /// The compositor did not release a buffer within the allotted time.
    HandoffTimeout,
    /// The other side of the frame handoff has gone away.
    HandoffDisconnected,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::EmptyRom => write!(f, "ROM size is zero"),
            PipelineError::RomTooLarge(size) => write!(f, "ROM size {} exceeds addressable memory", size),
            PipelineError::NoCacheBanks => write!(f, "unable to allocate any ROM cache banks"),
            PipelineError::NoFramebuffer => write!(f, "unable to allocate a framebuffer"),
            PipelineError::FirstBankUnreadable { expected, got } => write!(
                f,
                "failed to read first ROM bank (expected {} bytes, got {})",
                expected, got
            ),
            PipelineError::Io(e) => write!(f, "storage I/O: {}", e),
            PipelineError::InvalidPack(msg) => write!(f, "invalid packed ROM: {}", msg),
            PipelineError::HandoffTimeout => write!(f, "timed out waiting for a free framebuffer"),
            PipelineError::HandoffDisconnected => write!(f, "frame handoff disconnected"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        PipelineError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = PipelineError::FirstBankUnreadable { expected: 4096, got: 12 };
        assert_eq!(e.to_string(), "failed to read first ROM bank (expected 4096 bytes, got 12)");
        assert_eq!(PipelineError::EmptyRom.to_string(), "ROM size is zero");
        assert_eq!(
            PipelineError::RomTooLarge(1 << 33).to_string(),
            "ROM size 8589934592 exceeds addressable memory"
        );
    }

    #[test]
    fn test_io_source_is_kept() {
        use std::error::Error;
        let e: PipelineError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(e.source().is_some());
        assert!(PipelineError::NoFramebuffer.source().is_none());
    }
}
