//! Packet list staging and the transmit worker shared by backends

use crate::backend::{BackendError, FrameSink};
use crate::time::{unix_now, Pace, Pacer};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use nettest_core::{
    LoopMode, PacketSet, Schedule, ScheduledPacket, SeqNumber, TestTag, TimingProfile,
    MAX_FRAME_SIZE,
};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Device packet list built through the primitive backend calls
///
/// Entries are staged until the loop mode is set, which publishes the list
/// as one immutable [`Schedule`]. The published list stays in use while the
/// next one is staged.
#[derive(Debug, Default)]
pub struct PacketList {
    staging: Vec<PacketSet>,
    open: usize,
    active: Option<Arc<Schedule>>,
}

impl PacketList {
    /// Discard staged entries
    pub fn clear(&mut self) {
        self.staging.clear();
        self.open = 0;
    }

    /// Open a packet set of `size` entries
    pub fn begin_set(
        &mut self,
        size: usize,
        repeats: u64,
        delay: Duration,
    ) -> Result<(), BackendError> {
        if self.open > 0 {
            return Err(BackendError::Refused(format!(
                "previous packet set still expects {} entries",
                self.open
            )));
        }
        self.staging.push(PacketSet {
            packets: Vec::with_capacity(size),
            repeats,
            repeat_delay: delay,
        });
        self.open = size;
        Ok(())
    }

    /// Stage one entry; outside an open set it forms a set of its own
    pub fn append(&mut self, delay: Duration, frame: Bytes) -> Result<(), BackendError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(BackendError::Refused(format!(
                "frame of {} bytes exceeds {}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }

        let packet = ScheduledPacket { delay, frame };
        match self.staging.last_mut() {
            Some(set) if self.open > 0 => {
                set.packets.push(packet);
                self.open -= 1;
            }
            _ => self.staging.push(PacketSet {
                packets: vec![packet],
                repeats: 1,
                repeat_delay: Duration::ZERO,
            }),
        }
        Ok(())
    }

    /// Publish the staged entries
    pub fn finalize(&mut self, mode: LoopMode) -> Result<Arc<Schedule>, BackendError> {
        if self.open > 0 {
            return Err(BackendError::Refused(format!(
                "packet set still expects {} entries",
                self.open
            )));
        }
        let schedule = Arc::new(Schedule::from_sets(mem::take(&mut self.staging), mode));
        self.active = Some(Arc::clone(&schedule));
        Ok(schedule)
    }

    /// Published list, if any
    pub fn active(&self) -> Option<Arc<Schedule>> {
        self.active.clone()
    }
}

/// Background thread with a stop channel and a bounded join
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Clears the running flag and signals completion when the worker returns
struct DoneGuard {
    running: Arc<AtomicBool>,
    done_tx: Sender<()>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.done_tx.try_send(());
    }
}

impl Worker {
    /// Spawn `body`, which must return once the stop receiver fires or
    /// disconnects
    pub fn spawn<F>(name: &'static str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded(1);
        let (done_tx, done_rx) = channel::bounded(1);
        let running = Arc::new(AtomicBool::new(true));

        let guard = DoneGuard {
            running: Arc::clone(&running),
            done_tx,
        };
        let handle = thread::Builder::new()
            .name(format!("nettest-{}", name))
            .spawn(move || {
                let _guard = guard;
                body(stop_rx);
            })?;

        Ok(Worker {
            name,
            stop_tx,
            done_rx,
            running,
            handle: Some(handle),
        })
    }

    /// Whether the body is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the worker to stop and wait up to `timeout` for it
    pub fn stop(mut self, timeout: Duration) -> Result<(), BackendError> {
        let _ = self.stop_tx.try_send(());

        if self.is_running() && self.done_rx.recv_timeout(timeout).is_err() {
            tracing::error!("{} worker did not stop within {:?}", self.name, timeout);
            return Err(BackendError::Timeout(self.name));
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} worker panicked", self.name);
            }
        }
        tracing::debug!("{} worker stopped", self.name);
        Ok(())
    }
}

/// Where a transmit worker puts frames
pub trait Wire: Send + 'static {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Everything a transmit worker needs
pub struct TransmitJob<W> {
    pub schedule: Arc<Schedule>,
    pub profile: TimingProfile,
    pub wire: W,
    pub sink: Arc<dyn FrameSink>,
    /// Next test-tag sequence number, shared across transmit sessions
    pub next_seq: Arc<AtomicU32>,
}

impl<W: Wire> TransmitJob<W> {
    /// Drain the schedule, honouring its loop mode, until done or stopped
    pub fn run(mut self, stop: Receiver<()>) {
        let mut pacer = Pacer::new(self.profile);
        let mut passes = 0u64;
        let mut sent = 0u64;

        if self.schedule.is_empty() {
            tracing::debug!("Transmit: empty packet list");
            return;
        }
        if let LoopMode::Repeat { count: 0, .. } = self.schedule.loop_mode() {
            tracing::debug!("Transmit: zero passes requested");
            return;
        }

        let schedule = Arc::clone(&self.schedule);
        'outer: loop {
            for (delay, frame) in schedule.iter() {
                if pacer.wait(delay, &stop) == Pace::Stop {
                    break 'outer;
                }
                if self.send_one(frame) {
                    sent += 1;
                }
            }
            passes += 1;

            let delay = match schedule.loop_mode() {
                LoopMode::Once => break,
                LoopMode::Repeat { count, delay } if passes < count => delay,
                LoopMode::Repeat { .. } => break,
                LoopMode::Forever { delay } => delay,
            };
            if pacer.wait(delay, &stop) == Pace::Stop {
                break;
            }
        }

        tracing::debug!("Transmit finished: {} frames, {} passes", sent, passes);
    }

    fn send_one(&mut self, frame: &Bytes) -> bool {
        let stamped;
        let out: &[u8] = if TestTag::is_tagged(frame) {
            let seq = SeqNumber::new(self.next_seq.fetch_add(1, Ordering::Relaxed));
            stamped = TestTag::new(seq, unix_now()).stamp(frame);
            stamped.as_deref().unwrap_or(&frame[..])
        } else {
            &frame[..]
        };

        match self.wire.send(out) {
            Ok(()) => {
                self.sink.frame_sent(out.len());
                true
            }
            Err(e) => {
                tracing::warn!("Transmit error: {}", e);
                false
            }
        }
    }
}
