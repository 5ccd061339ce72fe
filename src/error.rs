//! Error taxonomy for the CAPTURE core (spec.md §7).
//!
//! Anything a user can cause externally (a bad packet, a bad module, a
//! slow peer) is handled locally and logged, not propagated as an error.
//! `CaptureError` covers only what must reach a caller: fatal startup
//! conditions, permanent source failures, and IPC failures from a
//! control-plane peer.

use std::io;

use failure::Fail;
use nix;

pub type Result<T> = ::std::result::Result<T, CaptureError>;

#[derive(Debug, Fail)]
pub enum CaptureError {
    #[fail(display = "shared-memory arena allocation failed: {}", inner)]
    ArenaAlloc { inner: io::Error },

    #[fail(
        display = "capbuf reservation of {} bytes would overwrite the still-referenced head (programming error)",
        requested
    )]
    ArenaOverflow { requested: usize },

    #[fail(display = "sniffer {:?} failed permanently: {}", name, inner)]
    SnifferFatal { name: String, inner: io::Error },

    #[fail(display = "module filter expression for {:?} failed to parse: {}", name, reason)]
    FilterParse { name: String, reason: String },

    #[fail(display = "IPC error from control-plane peer {:?}: {}", peer, inner)]
    ControlPlaneIpc { peer: &'static str, inner: io::Error },

    #[fail(display = "no sniffer could be initialised")]
    NoSniffers,

    #[fail(display = "configuration error: {}", reason)]
    Config { reason: String },

    #[fail(display = "{}", inner)]
    Io { inner: io::Error },
}

impl From<io::Error> for CaptureError {
    fn from(inner: io::Error) -> Self {
        CaptureError::Io { inner }
    }
}

impl From<nix::Error> for CaptureError {
    fn from(inner: nix::Error) -> Self {
        let errno = inner.as_errno().unwrap_or(nix::errno::Errno::EIO);
        CaptureError::Io {
            inner: io::Error::from_raw_os_error(errno as i32),
        }
    }
}
