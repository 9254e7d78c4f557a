//! Captured frames as a pcap byte stream
//!
//! Classic libpcap format, microsecond timestamps, Ethernet link type,
//! little-endian.

use crate::time::since_epoch;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::Read;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

/// pcap magic (microsecond resolution)
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
/// Ethernet link type
pub const LINKTYPE_ETHERNET: u32 = 1;
/// Global header length
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Per-record header length
pub const RECORD_HEADER_LEN: usize = 16;
/// Default snapshot length
pub const DEFAULT_SNAPLEN: u32 = 65535;
/// Default cap on the size of one capture file
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 64 * 1024 * 1024;

/// Capture file contents; sealed once handed to a reader
#[derive(Debug, Clone)]
enum Storage {
    Open(BytesMut),
    Sealed(Bytes),
}

/// In-memory pcap file
///
/// Records stop being added once the file would grow past `max_bytes`;
/// later frames are only counted as truncated, so the file stays a prefix
/// of the session.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    data: Storage,
    snaplen: u32,
    max_bytes: usize,
    frames: u64,
    truncated: u64,
}

impl CaptureBuffer {
    /// Empty capture holding only the global header
    pub fn new(snaplen: u32) -> Self {
        let mut data = BytesMut::with_capacity(GLOBAL_HEADER_LEN);
        data.put_u32_le(PCAP_MAGIC);
        data.put_u16_le(2);
        data.put_u16_le(4);
        data.put_i32_le(0);
        data.put_u32_le(0);
        data.put_u32_le(snaplen);
        data.put_u32_le(LINKTYPE_ETHERNET);

        CaptureBuffer {
            data: Storage::Open(data),
            snaplen,
            max_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            frames: 0,
            truncated: 0,
        }
    }

    /// Cap the file at `max_bytes`, global header included
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(GLOBAL_HEADER_LEN);
        self
    }

    fn len(&self) -> usize {
        match &self.data {
            Storage::Open(data) => data.len(),
            Storage::Sealed(data) => data.len(),
        }
    }

    /// Writable contents; reading mid-session means later records need a copy
    fn take_open(&mut self) -> BytesMut {
        match mem::replace(&mut self.data, Storage::Sealed(Bytes::new())) {
            Storage::Open(data) => data,
            Storage::Sealed(sealed) => BytesMut::from(&sealed[..]),
        }
    }

    /// Append one frame, truncated to the snapshot length
    ///
    /// Returns false if the frame was not recorded because the file is full.
    pub fn push(&mut self, frame: &[u8], at: SystemTime) -> bool {
        let caplen = frame.len().min(self.snaplen as usize);
        if self.truncated > 0 || self.len() + RECORD_HEADER_LEN + caplen > self.max_bytes {
            self.truncated += 1;
            return false;
        }

        let ts = since_epoch(at);
        let mut data = self.take_open();
        data.reserve(RECORD_HEADER_LEN + caplen);
        data.put_u32_le(ts.as_secs() as u32);
        data.put_u32_le(ts.subsec_micros());
        data.put_u32_le(caplen as u32);
        data.put_u32_le(frame.len() as u32);
        data.put_slice(&frame[..caplen]);
        self.data = Storage::Open(data);
        self.frames += 1;
        true
    }

    /// Frames captured
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Frames left out because the file reached its cap
    pub fn truncated_count(&self) -> u64 {
        self.truncated
    }

    /// Whole file so far
    ///
    /// Seals the buffer; repeated calls share the same allocation.
    pub fn to_bytes(&mut self) -> Bytes {
        let sealed = match mem::replace(&mut self.data, Storage::Sealed(Bytes::new())) {
            Storage::Open(data) => data.freeze(),
            Storage::Sealed(sealed) => sealed,
        };
        self.data = Storage::Sealed(sealed.clone());
        sealed
    }

    /// Drop all records
    pub fn clear(&mut self) {
        let data = match mem::replace(&mut self.data, Storage::Sealed(Bytes::new())) {
            Storage::Open(mut data) => {
                data.truncate(GLOBAL_HEADER_LEN);
                data
            }
            Storage::Sealed(sealed) => BytesMut::from(&sealed[..GLOBAL_HEADER_LEN]),
        };
        self.data = Storage::Open(data);
        self.frames = 0;
        self.truncated = 0;
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        CaptureBuffer::new(DEFAULT_SNAPLEN)
    }
}

/// Capture session shared between a backend and its receive thread
#[derive(Debug, Default)]
pub struct Capture {
    on: AtomicBool,
    buffer: Mutex<CaptureBuffer>,
}

impl Capture {
    /// Capture whose files are capped at `max_bytes`
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Capture {
            on: AtomicBool::new(false),
            buffer: Mutex::new(CaptureBuffer::default().with_max_bytes(max_bytes)),
        }
    }

    /// Start a new session, discarding the previous one
    pub fn start(&self) {
        self.buffer.lock().clear();
        self.on.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.on.store(false, Ordering::Release);
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    /// Record a frame if a session is running
    pub fn record(&self, frame: &[u8], at: SystemTime) {
        if !self.is_on() {
            return;
        }
        let mut buffer = self.buffer.lock();
        if !buffer.push(frame, at) && buffer.truncated_count() == 1 {
            tracing::warn!(
                "Capture full after {} frames, further frames are not recorded",
                buffer.frame_count()
            );
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.buffer.lock().frame_count()
    }

    pub fn truncated_count(&self) -> u64 {
        self.buffer.lock().truncated_count()
    }

    /// Reader over the pcap file captured so far
    pub fn reader(&self) -> Box<dyn Read + Send> {
        Box::new(self.buffer.lock().to_bytes().reader())
    }
}

/// One record read back from a pcap file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Capture time since the UNIX epoch
    pub at: Duration,
    /// Original frame length
    pub len: usize,
    /// Captured bytes
    pub data: Bytes,
}

/// Parse a pcap file produced by [`CaptureBuffer`]
///
/// Returns `None` if the header is not ours or a record is truncated.
pub fn parse_records(file: &[u8]) -> Option<Vec<CapturedFrame>> {
    let mut buf = file;
    if buf.remaining() < GLOBAL_HEADER_LEN || buf.get_u32_le() != PCAP_MAGIC {
        return None;
    }
    buf.advance(GLOBAL_HEADER_LEN - 4);

    let mut frames = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < RECORD_HEADER_LEN {
            return None;
        }
        let secs = buf.get_u32_le();
        let micros = buf.get_u32_le();
        let caplen = buf.get_u32_le() as usize;
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < caplen {
            return None;
        }

        frames.push(CapturedFrame {
            at: Duration::from_secs(u64::from(secs)) + Duration::from_micros(u64::from(micros)),
            len,
            data: buf.copy_to_bytes(caplen),
        });
    }
    Some(frames)
}
