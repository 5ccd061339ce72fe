//! IPC framing and peer table (spec.md §6). Every peer channel is a
//! stream-socket carrying self-delimiting messages:
//! `{peer-class tag u8, length u32, type u32, payload bytes[length]}`.
//! Endianness is host; a receiver detects a swap by inspecting a known
//! field (the tag byte, whose valid range is small and asymmetric enough
//! to distinguish a byte-swapped length from a sane one) and byte-swaps
//! the header on mismatch.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use mio::event::Evented;
use mio::unix::EventedFd;
use mio::{Poll, PollOpt, Ready, Token};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::{CaptureError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerClass {
    Supervisor = 0,
    Export = 1,
    CaptureClient = 2,
}

impl PeerClass {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PeerClass::Supervisor),
            1 => Some(PeerClass::Export),
            2 => Some(PeerClass::CaptureClient),
            _ => None,
        }
    }
}

/// A fully decoded message header plus its raw payload. `MessageType`
/// values are scoped per `PeerClass` (spec.md §6's three message tables);
/// the codec itself stays agnostic and leaves interpretation to the
/// caller, matching the core's stance that module/EXPORT payloads are
/// opaque blobs it only moves around.
#[derive(Debug)]
pub struct Frame {
    pub peer_class: PeerClass,
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

const HEADER_LEN: usize = 1 + 4 + 4;

/// Length-prefixed framing codec over a `BytesMut` read buffer, the same
/// shape as `tokio_codec::Decoder` the teacher wires up in `sampler.rs`,
/// but driven synchronously from the single-threaded event loop (spec.md
/// §5: no async runtime).
pub struct Codec {
    read_buf: BytesMut,
}

impl Codec {
    pub fn new() -> Self {
        Codec {
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feed freshly-read bytes into the decoder and pull out as many
    /// complete frames as are now available.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.read_buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.try_decode()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    /// A length field above this is almost certainly a byte-swapped
    /// header rather than a message anyone would legitimately send — a
    /// single node's IPC payloads are module blobs and tuple batches,
    /// not multi-gigabyte bodies.
    const SWAP_DETECT_THRESHOLD: u32 = 64 * 1024 * 1024;

    fn try_decode(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = self.read_buf[..HEADER_LEN].to_vec();
        let tag = header[0];
        let peer_class = match PeerClass::from_u8(tag) {
            Some(p) => p,
            None => {
                return Err(CaptureError::Config {
                    reason: format!("unrecognised IPC peer-class tag {}", tag),
                })
            }
        };

        let mut length = u32::from_ne_bytes([header[1], header[2], header[3], header[4]]);
        let mut msg_type = u32::from_ne_bytes([header[5], header[6], header[7], header[8]]);

        // Endianness detection (spec.md §6): inspect the length field, a
        // known-small-magnitude value on any sane message, and byte-swap
        // the header if it looks like it arrived from a peer of the
        // opposite endianness.
        if length > Self::SWAP_DETECT_THRESHOLD {
            length = length.swap_bytes();
            msg_type = msg_type.swap_bytes();
        }

        let length = length as usize;

        if self.read_buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        self.read_buf.advance(HEADER_LEN);
        let payload = self.read_buf.split_to(length).to_vec();

        Ok(Some(Frame {
            peer_class,
            msg_type,
            payload,
        }))
    }

    pub fn encode(peer_class: PeerClass, msg_type: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(peer_class as u8);
        buf.put_slice(&(payload.len() as u32).to_ne_bytes());
        buf.put_slice(&msg_type.to_ne_bytes());
        buf.put_slice(payload);
        buf
    }
}

/// SUPERVISOR -> CAPTURE message types.
pub mod supervisor_to_capture {
    pub const ADD_MODULE: u32 = 0;
    pub const DEL_MODULE: u32 = 1;
    pub const START: u32 = 2;
    pub const EXIT: u32 = 3;
}

/// CAPTURE -> SUPERVISOR message types.
pub mod capture_to_supervisor {
    pub const SNIFFERS_INITIALIZED: u32 = 0;
    pub const MODULE_ADDED: u32 = 1;
    pub const MODULE_REMOVED: u32 = 2;
    pub const MODULE_FAILED: u32 = 3;
}

/// EXPORT <-> CAPTURE message types.
pub mod export_capture {
    pub const ATTACH_MODULE: u32 = 0;
    pub const MODULE_ATTACHED: u32 = 1;
    pub const PROCESS_SHM_TUPLES: u32 = 2;
    pub const PROCESS_SER_TUPLES: u32 = 3;
    pub const DONE: u32 = 4;
}

/// Capture-client <-> CAPTURE message types.
pub mod client_capture {
    pub const OPEN: u32 = 0;
    pub const OPEN_RES: u32 = 1;
    pub const ERROR: u32 = 2;
    pub const NEW_BATCH: u32 = 3;
    pub const ACK_BATCH: u32 = 4;
}

/// One connected peer: a `UnixStream` (the process boundary in spec.md
/// §6 is "a stream-socket"; Unix domain sockets are the natural local
/// transport) plus its decode state, registered with `mio` exactly as
/// the teacher's `PerfFile` registers its fd in `fd.rs`.
pub struct Peer {
    pub class: PeerClass,
    stream: UnixStream,
    codec: Codec,
}

impl Peer {
    pub fn new(class: PeerClass, stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Peer {
            class,
            stream,
            codec: Codec::new(),
        })
    }

    /// Drain readable bytes and decode whatever complete frames result.
    /// Returns `Ok(Vec::new())` on `WouldBlock` (transient, spec.md §7).
    pub fn poll_read(&mut self) -> Result<Vec<Frame>> {
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(CaptureError::ControlPlaneIpc {
                peer: peer_label(self.class),
                inner: io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"),
            }),
            Ok(n) => self.codec.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(CaptureError::ControlPlaneIpc {
                peer: peer_label(self.class),
                inner: e,
            }),
        }
    }

    pub fn send(&mut self, msg_type: u32, payload: &[u8]) -> Result<()> {
        let frame = Codec::encode(self.class, msg_type, payload);
        self.stream.write_all(&frame).map_err(|e| CaptureError::ControlPlaneIpc {
            peer: peer_label(self.class),
            inner: e,
        })
    }
}

fn peer_label(class: PeerClass) -> &'static str {
    match class {
        PeerClass::Supervisor => "SUPERVISOR",
        PeerClass::Export => "EXPORT",
        PeerClass::CaptureClient => "capture-client",
    }
}

impl AsRawFd for Peer {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Evented for Peer {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        debug!("registering IPC peer fd {}", self.as_raw_fd());
        EventedFd(&self.as_raw_fd()).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.as_raw_fd()).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.as_raw_fd()).deregister(poll)
    }
}

/// Table of connected peers, indexed by a `mio::Token`-friendly small
/// integer. IPC errors from SUPERVISOR/EXPORT are fatal (spec.md §7); an
/// error from a capture-client only tears down that one peer.
pub struct PeerTable {
    peers: Vec<Option<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable { peers: Vec::new() }
    }

    pub fn insert(&mut self, peer: Peer) -> usize {
        for (i, slot) in self.peers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(peer);
                return i;
            }
        }
        self.peers.push(Some(peer));
        self.peers.len() - 1
    }

    pub fn remove(&mut self, idx: usize) -> Option<Peer> {
        self.peers.get_mut(idx).and_then(|p| p.take())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Peer> {
        self.peers.get_mut(idx).and_then(|p| p.as_mut())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Peer)> {
        self.peers
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| p.as_mut().map(|p| (i, p)))
    }
}

#[allow(dead_code)]
fn log_dropped_peer(idx: usize) {
    warn!("tearing down capture-client peer at slot {}", idx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = b"hello export";
        let encoded = Codec::encode(PeerClass::Export, export_capture::DONE, payload);

        let mut codec = Codec::new();
        let frames = codec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].peer_class, PeerClass::Export);
        assert_eq!(frames[0].msg_type, export_capture::DONE);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let payload = vec![0u8; 100];
        let encoded = Codec::encode(PeerClass::Supervisor, supervisor_to_capture::START, &payload);

        let mut codec = Codec::new();
        let frames = codec.feed(&encoded[..10]).unwrap();
        assert!(frames.is_empty());

        let frames = codec.feed(&encoded[10..]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let mut codec = Codec::new();
        let a = Codec::encode(PeerClass::Export, export_capture::DONE, b"a");
        let b = Codec::encode(PeerClass::Export, export_capture::DONE, b"bb");
        let mut combined = a.to_vec();
        combined.extend_from_slice(&b);
        let frames = codec.feed(&combined).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"a");
        assert_eq!(frames[1].payload, b"bb");
    }
}
