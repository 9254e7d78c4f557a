//! Test-flow tag
//!
//! Frames that belong to a measured flow end with a fixed 20-byte trailer:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic (NTTG)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +               Send Time (ns since UNIX epoch)                 +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Reserved                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Streams carry the trailer with zero sequence and time; the backend stamps
//! the real values at transmit time.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Trailer magic, "NTTG"
pub const TAG_MAGIC: u32 = 0x4E54_5447;

/// Trailer length in bytes
pub const TAG_LEN: usize = 20;

/// Decoded test-flow trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestTag {
    /// Sender sequence number
    pub seq: SeqNumber,
    /// Send time since the UNIX epoch
    pub sent_at: Duration,
}

impl TestTag {
    /// Create a tag
    pub fn new(seq: SeqNumber, sent_at: Duration) -> Self {
        TestTag { seq, sent_at }
    }

    /// Unstamped trailer for stream content
    pub fn placeholder() -> Bytes {
        TestTag::new(SeqNumber::new(0), Duration::ZERO).to_bytes()
    }

    /// Write the trailer
    pub fn put(&self, buf: &mut impl BufMut) {
        let nanos = u64::try_from(self.sent_at.as_nanos()).unwrap_or(u64::MAX);
        buf.put_u32(TAG_MAGIC);
        buf.put_u32(self.seq.as_raw());
        buf.put_u64(nanos);
        buf.put_u32(0);
    }

    /// Serialize the trailer on its own
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TAG_LEN);
        self.put(&mut buf);
        buf.freeze()
    }

    /// Parse the trailer at the end of a frame
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < TAG_LEN {
            return None;
        }

        let mut buf = &frame[frame.len() - TAG_LEN..];
        if buf.get_u32() != TAG_MAGIC {
            return None;
        }
        let seq = SeqNumber::new(buf.get_u32());
        let nanos = buf.get_u64();

        Some(TestTag {
            seq,
            sent_at: Duration::from_nanos(nanos),
        })
    }

    /// Whether a frame ends with a trailer
    pub fn is_tagged(frame: &[u8]) -> bool {
        frame.len() >= TAG_LEN && frame[frame.len() - TAG_LEN..][..4] == TAG_MAGIC.to_be_bytes()
    }

    /// Copy of `frame` with its trailer rewritten to this tag
    ///
    /// Returns `None` if the frame carries no trailer.
    pub fn stamp(&self, frame: &[u8]) -> Option<Bytes> {
        if !TestTag::is_tagged(frame) {
            return None;
        }

        let body = frame.len() - TAG_LEN;
        let mut out = BytesMut::with_capacity(frame.len());
        out.extend_from_slice(&frame[..body]);
        self.put(&mut out);
        Some(out.freeze())
    }
}
