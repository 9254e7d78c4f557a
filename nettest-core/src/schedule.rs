//! Device transmit schedule
//!
//! The scheduler turns a port's ordered streams into one linear list of
//! `(delay since previous frame, frame)` entries. Entries are grouped into
//! packet sets: a contiguous run of entries repeated `repeats` times with
//! `repeat_delay` between passes, so a stream repeating a million times does
//! not cost a million entries. A device-level [`LoopMode`] wraps the whole
//! list.

use crate::stream::{Emission, Stream, StreamId, StreamMode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Largest frame the scheduler accepts
pub const MAX_FRAME_SIZE: usize = 16384;

/// Default cap on entries materialised by interleaving
pub const DEFAULT_MAX_ENTRIES: usize = 1 << 20;

/// Schedule build errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Frame too large: {stream} frame {index} is {len} bytes (max {max})")]
    FrameTooLarge {
        stream: StreamId,
        index: usize,
        len: usize,
        max: usize,
    },

    #[error("Schedule too large: {entries} entries (max {max})")]
    TooLarge { entries: u64, max: usize },
}

/// How streams are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitMode {
    /// Each stream runs to completion before the next starts
    #[default]
    Sequential,
    /// Merged streams take turns frame by frame
    Interleaved,
}

/// Device-level repetition of the whole schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    /// Play once
    #[default]
    Once,
    /// Play `count` times in total; a count of zero plays nothing
    Repeat { count: u64, delay: Duration },
    /// Play until stopped
    Forever { delay: Duration },
}

impl LoopMode {
    /// Delay between passes, if the schedule loops at all
    pub fn delay(&self) -> Option<Duration> {
        match *self {
            LoopMode::Once => None,
            LoopMode::Repeat { delay, .. } | LoopMode::Forever { delay } => Some(delay),
        }
    }
}

/// One schedule entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPacket {
    /// Wait after the previous entry
    pub delay: Duration,
    /// Frame to send
    pub frame: Bytes,
}

/// Contiguous run of entries with its own repeat count
///
/// On every pass after the first, the first entry waits `repeat_delay` in
/// addition to its own delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSet {
    pub packets: Vec<ScheduledPacket>,
    pub repeats: u64,
    pub repeat_delay: Duration,
}

impl PacketSet {
    /// Entries produced by all passes
    pub fn expanded_len(&self) -> u64 {
        (self.packets.len() as u64).saturating_mul(self.repeats)
    }
}

/// Linear device schedule
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schedule {
    sets: Vec<PacketSet>,
    loop_mode: LoopMode,
}

impl Schedule {
    /// Schedule with nothing to send
    pub fn empty() -> Self {
        Schedule::default()
    }

    /// Assemble a schedule from prepared sets
    pub fn from_sets(sets: Vec<PacketSet>, loop_mode: LoopMode) -> Self {
        Schedule { sets, loop_mode }
    }

    /// Packet sets in device order
    pub fn sets(&self) -> &[PacketSet] {
        &self.sets
    }

    /// Device-level repetition
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Entries in one pass of the schedule
    pub fn packet_count(&self) -> u64 {
        self.sets
            .iter()
            .fold(0u64, |acc, set| acc.saturating_add(set.expanded_len()))
    }

    /// Whether one pass sends nothing
    pub fn is_empty(&self) -> bool {
        self.packet_count() == 0
    }

    /// Flattened entries of one pass
    pub fn iter(&self) -> ScheduleIter<'_> {
        ScheduleIter {
            sets: &self.sets,
            set: 0,
            pass: 0,
            packet: 0,
        }
    }
}

/// Iterator over one pass of a [`Schedule`]
#[derive(Debug, Clone)]
pub struct ScheduleIter<'a> {
    sets: &'a [PacketSet],
    set: usize,
    pass: u64,
    packet: usize,
}

impl<'a> Iterator for ScheduleIter<'a> {
    type Item = (Duration, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let set = self.sets.get(self.set)?;

            if self.pass >= set.repeats || set.packets.is_empty() {
                self.set += 1;
                self.pass = 0;
                self.packet = 0;
                continue;
            }

            let entry = &set.packets[self.packet];
            let mut delay = entry.delay;
            if self.packet == 0 && self.pass > 0 {
                delay += set.repeat_delay;
            }

            self.packet += 1;
            if self.packet == set.packets.len() {
                self.packet = 0;
                self.pass += 1;
            }

            return Some((delay, &entry.frame));
        }
    }
}

/// Bounds enforced while building
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleLimits {
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// Largest interleaved expansion
    pub max_entries: usize,
}

impl Default for ScheduleLimits {
    fn default() -> Self {
        ScheduleLimits {
            max_frame_size: MAX_FRAME_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// A stream's burst, validated and ready to place
struct Prepared {
    mode: StreamMode,
    emissions: Vec<Emission>,
    repeats: u64,
    repeat_delay: Duration,
}

impl Prepared {
    fn into_set(self) -> PacketSet {
        let mut prev = Duration::ZERO;
        let packets = self
            .emissions
            .into_iter()
            .map(|emission| {
                let delay = emission.offset.saturating_sub(prev);
                prev = emission.offset;
                ScheduledPacket {
                    delay,
                    frame: emission.frame,
                }
            })
            .collect();

        PacketSet {
            packets,
            repeats: self.repeats,
            repeat_delay: self.repeat_delay,
        }
    }
}

/// Walks one stream's full expansion (bursts × frames)
struct Cursor {
    emissions: Vec<Emission>,
    repeats: u64,
    repeat_delay: Duration,
    burst: u64,
    index: usize,
}

impl Cursor {
    fn is_exhausted(&self) -> bool {
        self.burst >= self.repeats
    }

    /// Gap since this stream's previous frame, and the frame
    fn advance(&mut self) -> (Duration, Bytes) {
        let emission = &self.emissions[self.index];
        let gap = if self.index == 0 {
            if self.burst == 0 {
                emission.offset
            } else {
                self.repeat_delay + emission.offset
            }
        } else {
            emission
                .offset
                .saturating_sub(self.emissions[self.index - 1].offset)
        };
        let frame = emission.frame.clone();

        self.index += 1;
        if self.index == self.emissions.len() {
            self.index = 0;
            self.burst += 1;
        }
        (gap, frame)
    }
}

/// Builds a [`Schedule`] from a port's streams
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleBuilder {
    mode: TransmitMode,
    loop_mode: LoopMode,
    limits: ScheduleLimits,
}

impl ScheduleBuilder {
    /// Builder for the given mode, playing once
    pub fn new(mode: TransmitMode) -> Self {
        ScheduleBuilder {
            mode,
            loop_mode: LoopMode::Once,
            limits: ScheduleLimits::default(),
        }
    }

    /// Set the device-level loop
    pub fn with_loop_mode(mut self, loop_mode: LoopMode) -> Self {
        self.loop_mode = loop_mode;
        self
    }

    /// Set build limits
    pub fn with_limits(mut self, limits: ScheduleLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the schedule for `streams`, in collection order
    pub fn build(&self, streams: &[Arc<dyn Stream>]) -> Result<Schedule, ScheduleError> {
        let prepared = self.prepare(streams)?;

        let sets = match self.mode {
            TransmitMode::Sequential => prepared.into_iter().map(Prepared::into_set).collect(),
            TransmitMode::Interleaved => self.interleave(prepared)?,
        };

        let schedule = Schedule::from_sets(sets, self.loop_mode);
        tracing::debug!(
            "Built {:?} schedule: {} sets, {} packets per pass",
            self.mode,
            schedule.sets().len(),
            schedule.packet_count()
        );
        Ok(schedule)
    }

    fn prepare(&self, streams: &[Arc<dyn Stream>]) -> Result<Vec<Prepared>, ScheduleError> {
        let mut prepared = Vec::with_capacity(streams.len());

        for stream in streams {
            if !stream.is_enabled() || stream.repeat_count() == 0 {
                continue;
            }

            let emissions = stream.emissions();
            if emissions.is_empty() {
                tracing::debug!("{} has no frames, skipping", stream.id());
                continue;
            }

            if let Some((index, emission)) = emissions
                .iter()
                .enumerate()
                .find(|(_, e)| e.frame.len() > self.limits.max_frame_size)
            {
                return Err(ScheduleError::FrameTooLarge {
                    stream: stream.id(),
                    index,
                    len: emission.frame.len(),
                    max: self.limits.max_frame_size,
                });
            }

            prepared.push(Prepared {
                mode: stream.mode(),
                emissions,
                repeats: stream.repeat_count(),
                repeat_delay: stream.repeat_delay(),
            });
        }

        Ok(prepared)
    }

    fn interleave(&self, prepared: Vec<Prepared>) -> Result<Vec<PacketSet>, ScheduleError> {
        let (merged, standalone): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .partition(|p| p.mode == StreamMode::Merged);

        let entries = merged.iter().fold(0u64, |acc, p| {
            acc.saturating_add((p.emissions.len() as u64).saturating_mul(p.repeats))
        });
        if entries > self.limits.max_entries as u64 {
            return Err(ScheduleError::TooLarge {
                entries,
                max: self.limits.max_entries,
            });
        }

        let mut active: Vec<Cursor> = merged
            .into_iter()
            .map(|p| Cursor {
                emissions: p.emissions,
                repeats: p.repeats,
                repeat_delay: p.repeat_delay,
                burst: 0,
                index: 0,
            })
            .collect();

        let mut packets = Vec::with_capacity(entries as usize);
        let mut round = Vec::with_capacity(active.len());

        while !active.is_empty() {
            // The round lasts as long as its slowest participant's own gap.
            let mut round_delay = Duration::ZERO;
            for cursor in active.iter_mut() {
                let (gap, frame) = cursor.advance();
                round_delay = round_delay.max(gap);
                round.push(frame);
            }

            for (i, frame) in round.drain(..).enumerate() {
                packets.push(ScheduledPacket {
                    delay: if i == 0 { round_delay } else { Duration::ZERO },
                    frame,
                });
            }

            active.retain(|cursor| !cursor.is_exhausted());
        }

        let mut sets = Vec::with_capacity(1 + standalone.len());
        if !packets.is_empty() {
            sets.push(PacketSet {
                packets,
                repeats: 1,
                repeat_delay: Duration::ZERO,
            });
        }
        sets.extend(standalone.into_iter().map(Prepared::into_set));
        Ok(sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BurstStream;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 60])
    }

    fn stream(id: u32, tags: &[u8], repeats: u64) -> Arc<dyn Stream> {
        Arc::new(
            BurstStream::new(StreamId(id), tags.iter().map(|&t| frame(t)).collect())
                .with_gap(Duration::from_micros(10))
                .with_repeats(repeats, Duration::from_micros(100)),
        )
    }

    fn order(schedule: &Schedule) -> Vec<u8> {
        schedule.iter().map(|(_, f)| f[0]).collect()
    }

    #[test]
    fn test_sequential_concatenates() {
        let streams = vec![stream(1, &[1, 2], 2), stream(2, &[3], 3)];
        let schedule = ScheduleBuilder::new(TransmitMode::Sequential)
            .build(&streams)
            .unwrap();

        assert_eq!(schedule.sets().len(), 2);
        assert_eq!(schedule.packet_count(), 7);
        assert_eq!(order(&schedule), vec![1, 2, 1, 2, 3, 3, 3]);
    }

    #[test]
    fn test_sequential_delays() {
        let streams = vec![stream(1, &[1, 2], 2)];
        let schedule = ScheduleBuilder::new(TransmitMode::Sequential)
            .build(&streams)
            .unwrap();

        let delays: Vec<_> = schedule.iter().map(|(d, _)| d.as_micros()).collect();
        assert_eq!(delays, vec![0, 10, 100, 10]);
    }

    #[test]
    fn test_interleaved_round_robin() {
        let streams = vec![stream(1, &[1], 3), stream(2, &[2], 1), stream(3, &[3], 2)];
        let schedule = ScheduleBuilder::new(TransmitMode::Interleaved)
            .build(&streams)
            .unwrap();

        assert_eq!(schedule.sets().len(), 1);
        assert_eq!(order(&schedule), vec![1, 2, 3, 1, 3, 1]);
    }

    #[test]
    fn test_interleaved_multi_frame_bursts() {
        let streams = vec![stream(1, &[1, 2], 1), stream(2, &[3, 4, 5], 1)];
        let schedule = ScheduleBuilder::new(TransmitMode::Interleaved)
            .build(&streams)
            .unwrap();

        assert_eq!(order(&schedule), vec![1, 3, 2, 4, 5]);
    }

    #[test]
    fn test_interleaved_round_delay_is_slowest_gap() {
        let fast: Arc<dyn Stream> = Arc::new(
            BurstStream::new(StreamId(1), vec![frame(1)])
                .with_repeats(3, Duration::from_micros(5)),
        );
        let slow: Arc<dyn Stream> = Arc::new(
            BurstStream::new(StreamId(2), vec![frame(2)])
                .with_repeats(2, Duration::from_micros(50)),
        );
        let schedule = ScheduleBuilder::new(TransmitMode::Interleaved)
            .build(&[fast, slow])
            .unwrap();

        let entries: Vec<_> = schedule
            .iter()
            .map(|(d, f)| (d.as_micros(), f[0]))
            .collect();
        assert_eq!(entries, vec![(0, 1), (0, 2), (50, 1), (0, 2), (5, 1)]);
    }

    #[test]
    fn test_standalone_kept_contiguous_in_interleaved_mode() {
        let standalone: Arc<dyn Stream> = Arc::new(
            BurstStream::new(StreamId(9), vec![frame(9)])
                .with_repeats(2, Duration::ZERO)
                .with_mode(StreamMode::Standalone),
        );
        let streams = vec![stream(1, &[1], 2), standalone, stream(2, &[2], 2)];
        let schedule = ScheduleBuilder::new(TransmitMode::Interleaved)
            .build(&streams)
            .unwrap();

        assert_eq!(schedule.sets().len(), 2);
        assert_eq!(order(&schedule), vec![1, 2, 1, 2, 9, 9]);
    }

    #[test]
    fn test_disabled_and_empty_streams_skipped() {
        let disabled: Arc<dyn Stream> =
            Arc::new(BurstStream::new(StreamId(5), vec![frame(5)]).with_enabled(false));
        let empty: Arc<dyn Stream> = Arc::new(BurstStream::new(StreamId(6), vec![]));
        let streams = vec![disabled, empty, stream(1, &[1], 0), stream(2, &[2], 1)];

        for mode in [TransmitMode::Sequential, TransmitMode::Interleaved] {
            let schedule = ScheduleBuilder::new(mode).build(&streams).unwrap();
            assert_eq!(order(&schedule), vec![2]);
        }
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let big: Arc<dyn Stream> = Arc::new(BurstStream::new(
            StreamId(4),
            vec![frame(1), Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1])],
        ));
        let err = ScheduleBuilder::new(TransmitMode::Sequential)
            .build(&[big])
            .unwrap_err();

        assert_eq!(
            err,
            ScheduleError::FrameTooLarge {
                stream: StreamId(4),
                index: 1,
                len: MAX_FRAME_SIZE + 1,
                max: MAX_FRAME_SIZE,
            }
        );
    }

    #[test]
    fn test_frame_at_limit_accepted() {
        let s: Arc<dyn Stream> = Arc::new(BurstStream::new(
            StreamId(4),
            vec![Bytes::from(vec![0u8; MAX_FRAME_SIZE])],
        ));
        assert!(ScheduleBuilder::new(TransmitMode::Sequential).build(&[s]).is_ok());
    }

    #[test]
    fn test_interleave_entry_cap() {
        let streams = vec![stream(1, &[1, 2], 600), stream(2, &[3], 600)];
        let limits = ScheduleLimits {
            max_entries: 1000,
            ..Default::default()
        };

        let err = ScheduleBuilder::new(TransmitMode::Interleaved)
            .with_limits(limits)
            .build(&streams)
            .unwrap_err();
        assert_eq!(err, ScheduleError::TooLarge { entries: 1800, max: 1000 });

        // Sequential mode keeps repeats compressed, so it fits
        let schedule = ScheduleBuilder::new(TransmitMode::Sequential)
            .with_limits(limits)
            .build(&streams)
            .unwrap();
        assert_eq!(schedule.packet_count(), 1800);
    }

    #[test]
    fn test_loop_mode_carried() {
        let loop_mode = LoopMode::Forever {
            delay: Duration::from_millis(1),
        };
        let schedule = ScheduleBuilder::new(TransmitMode::Sequential)
            .with_loop_mode(loop_mode)
            .build(&[stream(1, &[1], 1)])
            .unwrap();

        assert_eq!(schedule.loop_mode(), loop_mode);
        assert_eq!(loop_mode.delay(), Some(Duration::from_millis(1)));
        assert_eq!(LoopMode::Once.delay(), None);
    }

    #[test]
    fn test_empty_schedule() {
        let schedule = ScheduleBuilder::new(TransmitMode::Interleaved).build(&[]).unwrap();
        assert!(schedule.is_empty());
        assert_eq!(schedule.iter().count(), 0);
    }
}
