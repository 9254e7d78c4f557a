//! Streams as seen by the scheduler
//!
//! Stream content is built elsewhere; the scheduler only needs a burst of
//! already-serialized frames with their timing, and how often to repeat it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable external stream identifier
///
/// Independent of the stream's position in a port's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// How a stream's frames are placed in the device schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Frames interleave with other merged streams
    #[default]
    Merged,
    /// Frames form one contiguous repeating burst of their own
    Standalone,
}

/// One frame of a burst and when it goes out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Offset from the start of the burst
    pub offset: Duration,
    /// Serialized frame
    pub frame: Bytes,
}

/// A configured packet stream
///
/// A burst is the ordered list of [`Emission`]s. It is sent
/// [`repeat_count`](Stream::repeat_count) times, with
/// [`repeat_delay`](Stream::repeat_delay) between the last frame of one burst
/// and the first frame of the next.
pub trait Stream: Send + Sync {
    /// Stable identifier
    fn id(&self) -> StreamId;

    /// Disabled streams contribute nothing to the schedule
    fn is_enabled(&self) -> bool {
        true
    }

    /// Placement in the schedule
    fn mode(&self) -> StreamMode {
        StreamMode::Merged
    }

    /// One burst, offsets non-decreasing
    fn emissions(&self) -> Vec<Emission>;

    /// Number of bursts
    fn repeat_count(&self) -> u64;

    /// Gap between bursts
    fn repeat_delay(&self) -> Duration;

    /// Distinct frames per burst
    fn frame_count(&self) -> usize {
        self.emissions().len()
    }

    /// Frame at `index` in the expanded stream (wraps at the burst length)
    fn frame(&self, index: usize) -> Option<Bytes> {
        let emissions = self.emissions();
        if emissions.is_empty() {
            return None;
        }
        Some(emissions[index % emissions.len()].frame.clone())
    }
}

/// Stream with explicit frames at a fixed inter-frame gap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstStream {
    id: StreamId,
    frames: Vec<Bytes>,
    gap: Duration,
    repeats: u64,
    repeat_delay: Duration,
    mode: StreamMode,
    enabled: bool,
}

impl BurstStream {
    /// One burst of `frames`, back-to-back, sent once
    pub fn new(id: StreamId, frames: Vec<Bytes>) -> Self {
        BurstStream {
            id,
            frames,
            gap: Duration::ZERO,
            repeats: 1,
            repeat_delay: Duration::ZERO,
            mode: StreamMode::Merged,
            enabled: true,
        }
    }

    /// Set the inter-frame gap
    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.gap = gap;
        self
    }

    /// Repeat the burst `repeats` times with `delay` between bursts
    pub fn with_repeats(mut self, repeats: u64, delay: Duration) -> Self {
        self.repeats = repeats;
        self.repeat_delay = delay;
        self
    }

    /// Set the placement mode
    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Inter-frame gap
    pub fn gap(&self) -> Duration {
        self.gap
    }

    /// Frames of one burst
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }
}

impl Stream for BurstStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn mode(&self) -> StreamMode {
        self.mode
    }

    fn emissions(&self) -> Vec<Emission> {
        let mut offset = Duration::ZERO;
        self.frames
            .iter()
            .map(|frame| {
                let emission = Emission {
                    offset,
                    frame: frame.clone(),
                };
                offset += self.gap;
                emission
            })
            .collect()
    }

    fn repeat_count(&self) -> u64 {
        self.repeats
    }

    fn repeat_delay(&self) -> Duration {
        self.repeat_delay
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, index: usize) -> Option<Bytes> {
        if self.frames.is_empty() {
            None
        } else {
            Some(self.frames[index % self.frames.len()].clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_emissions() {
        let stream = BurstStream::new(
            StreamId(3),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")],
        )
        .with_gap(Duration::from_micros(10));

        let emissions = stream.emissions();
        assert_eq!(emissions.len(), 3);
        assert_eq!(emissions[0].offset, Duration::ZERO);
        assert_eq!(emissions[2].offset, Duration::from_micros(20));
        assert_eq!(emissions[1].frame, Bytes::from_static(b"b"));
    }

    #[test]
    fn test_frame_index_wraps() {
        let stream = BurstStream::new(
            StreamId(1),
            vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")],
        )
        .with_repeats(10, Duration::ZERO);

        assert_eq!(stream.frame(0), Some(Bytes::from_static(b"x")));
        assert_eq!(stream.frame(3), Some(Bytes::from_static(b"y")));
        assert_eq!(BurstStream::new(StreamId(2), vec![]).frame(0), None);
    }

    #[test]
    fn test_defaults() {
        let stream = BurstStream::new(StreamId(9), vec![Bytes::from_static(b"z")]);
        assert!(stream.is_enabled());
        assert_eq!(stream.mode(), StreamMode::Merged);
        assert_eq!(stream.repeat_count(), 1);
        assert_eq!(stream.id().to_string(), "stream#9");
    }
}
