use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use crossbeam_queue::ArrayQueue;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginFrameArgsKind {
    Normal,
    /// Delivered after its frame time had already passed.
    Missed,
}

/// One vsync tick: when the frame started, when its draw must be done and
/// how far apart frames are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginFrameArgs {
    pub frame_time: Instant,
    pub deadline: Instant,
    pub interval: Duration,
    pub sequence_number: u64,
    pub kind: BeginFrameArgsKind,
}

impl BeginFrameArgs {
    pub fn new(frame_time: Instant, interval: Duration, sequence_number: u64) -> Self {
        Self {
            frame_time,
            deadline: frame_time + interval,
            interval,
            sequence_number,
            kind: BeginFrameArgsKind::Normal,
        }
    }

    pub fn as_missed(self) -> Self {
        Self {
            kind: BeginFrameArgsKind::Missed,
            ..self
        }
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn as_value(&self, now: Instant) -> serde_json::Value {
        json!({
            "sequence_number": self.sequence_number,
            "kind": format!("{:?}", self.kind),
            "interval_us": self.interval.as_micros() as u64,
            "frame_time_age_us": now.saturating_duration_since(self.frame_time).as_micros() as u64,
            "deadline_in_us": self.deadline.saturating_duration_since(now).as_micros() as u64,
        })
    }
}

/// Ticks at a fixed interval, phase-aligned to the first tick.
#[derive(Debug)]
pub struct SyntheticBeginFrameSource {
    interval: Duration,
    timebase: Option<Instant>,
    next_sequence_number: u64,
}

impl SyntheticBeginFrameSource {
    pub fn new(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "begin frame interval must be non-zero");
        Self {
            interval,
            timebase: None,
            next_sequence_number: 1,
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Frame time of the most recent tick at or before `now`.
    fn last_tick_time(&self, timebase: Instant, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(timebase);
        let ticks = elapsed.as_nanos() / self.interval.as_nanos();
        let ticks = u32::try_from(ticks).unwrap_or(u32::MAX);
        timebase + self.interval * ticks
    }

    /// Args for the tick covering `now`. Ticks skipped since the last call
    /// are folded into the sequence number.
    pub fn tick(&mut self, now: Instant) -> BeginFrameArgs {
        let timebase = *self.timebase.get_or_insert(now);
        let frame_time = self.last_tick_time(timebase, now);
        let ticks_since_timebase =
            (frame_time.saturating_duration_since(timebase).as_nanos() / self.interval.as_nanos()) as u64;
        let sequence_number = (ticks_since_timebase + 1).max(self.next_sequence_number);
        self.next_sequence_number = sequence_number + 1;
        BeginFrameArgs::new(frame_time, self.interval, sequence_number)
    }

    /// When the tick after `now` starts.
    pub fn next_tick_time(&self, now: Instant) -> Instant {
        match self.timebase {
            Some(timebase) => self.last_tick_time(timebase, now) + self.interval,
            None => now,
        }
    }
}

// Single producer, single consumer. The Arc is never handed out.
struct SharedBeginFrameMailbox {
    // Full mailbox evicts the oldest frame; a late frame is worthless once a
    // newer one exists.
    queue: ArrayQueue<BeginFrameArgs>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    missed: AtomicU64,
    pushed: AtomicU64,
}

pub struct BeginFrameProducer {
    shared: Arc<SharedBeginFrameMailbox>,
    // May move to the vsync thread but not be shared.
    _not_sync: PhantomData<Cell<()>>,
}

impl BeginFrameProducer {
    pub fn push(&self, args: BeginFrameArgs) {
        let mut pending_args = args;
        loop {
            match self.shared.queue.push(pending_args) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    match self.shared.notify_sender.try_send(()) {
                        Ok(()) | Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            panic!("begin frame notify channel disconnected")
                        }
                    }
                    return;
                }
                Err(returned_args) => {
                    pending_args = returned_args;
                    if self.shared.queue.pop().is_some() {
                        self.shared.missed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    pub fn missed_frames(&self) -> u64 {
        self.shared.missed.load(Ordering::Relaxed)
    }

    pub fn pushed_frames(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

pub struct BeginFrameConsumer {
    shared: Arc<SharedBeginFrameMailbox>,
    _not_sync: PhantomData<Cell<()>>,
}

impl BeginFrameConsumer {
    /// Newest queued frame, skipping and counting older ones as missed.
    fn take_latest(&self) -> Option<BeginFrameArgs> {
        let mut latest = self.shared.queue.pop()?;
        while let Some(newer) = self.shared.queue.pop() {
            self.shared.missed.fetch_add(1, Ordering::Relaxed);
            latest = newer;
        }
        Some(latest)
    }

    /// Waits up to `wait_timeout` for a frame and returns the newest one.
    ///
    /// A frame whose deadline already passed at `now` comes back marked
    /// [`BeginFrameArgsKind::Missed`].
    pub fn next_with_wait(&self, wait_timeout: Duration) -> Option<BeginFrameArgs> {
        if let Some(args) = self.take_latest() {
            return Some(mark_if_missed(args));
        }
        if wait_timeout.is_zero() {
            return None;
        }

        let wait_deadline = Instant::now() + wait_timeout;
        loop {
            let now = Instant::now();
            if now >= wait_deadline {
                return None;
            }
            match self
                .shared
                .notify_receiver
                .recv_timeout(wait_deadline.saturating_duration_since(now))
            {
                Ok(()) => {
                    if let Some(args) = self.take_latest() {
                        return Some(mark_if_missed(args));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("begin frame notify channel disconnected")
                }
            }
        }
    }

    pub fn missed_frames(&self) -> u64 {
        self.shared.missed.load(Ordering::Relaxed)
    }

    pub fn pushed_frames(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

fn mark_if_missed(args: BeginFrameArgs) -> BeginFrameArgs {
    if args.deadline_passed(Instant::now()) {
        args.as_missed()
    } else {
        args
    }
}

pub fn begin_frame_mailbox(capacity: usize) -> (BeginFrameProducer, BeginFrameConsumer) {
    assert!(capacity > 0, "begin frame mailbox capacity must be greater than zero");

    let (notify_sender, notify_receiver) = bounded(1);
    let shared = Arc::new(SharedBeginFrameMailbox {
        queue: ArrayQueue::new(capacity),
        notify_sender,
        notify_receiver,
        missed: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
    });

    (
        BeginFrameProducer {
            shared: shared.clone(),
            _not_sync: PhantomData,
        },
        BeginFrameConsumer {
            shared,
            _not_sync: PhantomData,
        },
    )
}
