//! Per-track decode loop with a single-slot ready-frame handoff.
//!
//! Each [`TrackProcessor`] owns:
//! - a bounded [`PacketQueue`] fed by the packet reader
//! - a background decode thread driving a [`DecodeEngine`]
//! - one ready-frame slot consumed by the output side (audio callback or video refresh)
//!
//! The slot is guarded by a mutex plus a `ready` flag. The decode loop sleeps on a
//! [`Condvar`] while the slot is occupied or the queue is dry, and is woken by consumers,
//! by `push_packet`, and by `close`.
//!
//! The audio and video variants only differ in the [`FrameFinisher`] they plug in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};

use crate::config::PipelineConfig;
use crate::engine::{DecodeEngine, DecodedFrame, Retrieved, SubmitStatus};
use crate::packet::{QueueItem, TimeBase, TrackKind};
use crate::queue::PacketQueue;
use crate::status::{PipelineEvent, TrackState, TrackStatus};
use crate::throttle::WarnThrottle;

/// Track-specific step turning a decoded frame into presentable data.
pub trait FrameFinisher<F>: Send + 'static {
    /// Data stored in the ready slot. Buffers are reused across frames.
    type Output: Default + Send + 'static;

    /// Finish `frame` into `out` and return its presentation timestamp in milliseconds,
    /// or `None` when the frame yielded nothing to present yet.
    ///
    /// `stream_pts_ms` is the frame's own timestamp converted from the stream time base;
    /// `prev_pts_ms` is the timestamp of the previously produced frame.
    fn finish(
        &mut self,
        frame: &F,
        stream_pts_ms: Option<u64>,
        prev_pts_ms: Option<u64>,
        out: &mut Self::Output,
    ) -> Result<Option<u64>>;
}

/// Anything the packet reader can route packets to.
pub trait PacketSink: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn push_packet(&self, item: QueueItem);
    fn needs_packet(&self) -> bool;
    /// `true` once the track stopped consuming packets (finished, failed or closed).
    fn is_terminal(&self) -> bool;
}

struct Slot<T> {
    data: T,
    pts_ms: u64,
    /// Decode loop parked because the queue was empty.
    input_wait: bool,
}

pub(crate) struct TrackShared<T> {
    kind: TrackKind,
    queue: PacketQueue,
    slot: Mutex<Slot<T>>,
    cv: Condvar,
    /// Mirrors "slot holds a frame"; only written while `slot` is locked.
    ready: AtomicBool,
    shutdown: AtomicBool,
    clock_ms: AtomicU64,
    finished: AtomicBool,
    /// Decode loop returned, for any reason.
    exited: AtomicBool,
    /// Shutdown was requested and confirmed.
    closed: AtomicBool,
    state: Mutex<TrackState>,
    frames_produced: AtomicU64,
    starved_events: AtomicU64,
    starve_warn: WarnThrottle,
    events: Mutex<Option<Sender<PipelineEvent>>>,
}

impl<T> TrackShared<T> {
    fn set_state(&self, state: TrackState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Wake the decode loop. Taking the slot lock first avoids a lost wakeup between
    /// the loop's predicate check and its wait.
    fn wake(&self) {
        drop(self.slot.lock());
        self.cv.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Decode loop plus ready-frame slot for one track.
pub struct TrackProcessor<T> {
    shared: Arc<TrackShared<T>>,
    launch: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    config: PipelineConfig,
}

impl<T: Default + Send + 'static> TrackProcessor<T> {
    /// Create a processor; nothing runs until [`TrackProcessor::start`].
    pub fn new<E, F>(
        kind: TrackKind,
        time_base: TimeBase,
        config: &PipelineConfig,
        engine: E,
        finisher: F,
    ) -> Self
    where
        E: DecodeEngine,
        F: FrameFinisher<E::Frame, Output = T>,
    {
        let config = config.clone().sanitized();
        let shared = Arc::new(TrackShared {
            kind,
            queue: PacketQueue::new(config.packet_high_watermark),
            slot: Mutex::new(Slot {
                data: T::default(),
                pts_ms: 0,
                input_wait: false,
            }),
            cv: Condvar::new(),
            ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            clock_ms: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Mutex::new(TrackState::Idle),
            frames_produced: AtomicU64::new(0),
            starved_events: AtomicU64::new(0),
            starve_warn: WarnThrottle::new(config.warn_interval),
            events: Mutex::new(None),
        });

        let worker = DecodeWorker {
            shared: shared.clone(),
            engine,
            finisher,
            time_base,
            pending: None,
            input_ended: false,
            last_pts_ms: None,
            scratch: T::default(),
        };

        Self {
            shared,
            launch: Mutex::new(Some(Box::new(move || worker.run()))),
            handle: Mutex::new(None),
            config,
        }
    }
}

impl<T: Send + 'static> TrackProcessor<T> {
    /// Publish lifecycle events to `tx` (finished, failed, closed).
    pub fn set_event_sink(&self, tx: Sender<PipelineEvent>) {
        *self.shared.events.lock() = Some(tx);
    }

    pub fn kind(&self) -> TrackKind {
        self.shared.kind
    }

    /// Append a packet (or the end marker). Never blocks on queue capacity.
    pub fn push_packet(&self, item: QueueItem) {
        self.shared.queue.push(item);
        {
            let mut slot = self.shared.slot.lock();
            slot.input_wait = false;
        }
        self.shared.cv.notify_all();
    }

    /// `true` while the packet queue is below its high watermark.
    pub fn needs_packet(&self) -> bool {
        self.shared.queue.needs_packet()
    }

    /// Launch the decode thread. A second call is an error.
    pub fn start(&self) -> Result<()> {
        let kind = self.shared.kind;
        let launch = self
            .launch
            .lock()
            .take()
            .ok_or_else(|| anyhow!("{kind} track processor already started"))?;

        self.shared.set_state(TrackState::Running);
        let spawned = thread::Builder::new()
            .name(format!("{kind}-decode"))
            .spawn(launch)
            .with_context(|| format!("spawn {kind} decode thread"));
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                tracing::info!(track = %kind, "decode loop started");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(TrackState::Failed(format!("{e:#}")));
                self.shared.exited.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Ask the decode loop to exit and wait for it within the configured retry budget.
    ///
    /// Returns `true` once the loop confirmed shutdown. On `false` the thread is left
    /// detached; the caller decides whether to continue tearing down.
    pub fn close(&self) -> bool {
        let kind = self.shared.kind;
        self.shared.request_shutdown();

        if self.launch.lock().take().is_some() {
            // Never started: nothing to wait for.
            self.shared.closed.store(true, Ordering::SeqCst);
            self.shared.set_state(TrackState::Closed);
            self.release_ready_frame();
            return true;
        }

        for attempt in 0..self.config.close_attempts {
            if self.shared.exited.load(Ordering::SeqCst) {
                break;
            }
            tracing::trace!(track = %kind, attempt, "waiting for decode loop to exit");
            self.shared.wake();
            thread::sleep(self.config.close_retry_interval);
        }

        if !self.shared.exited.load(Ordering::SeqCst) {
            tracing::warn!(
                track = %kind,
                attempts = self.config.close_attempts,
                "decode loop did not confirm shutdown"
            );
            return false;
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(track = %kind, "decode thread panicked");
            }
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.release_ready_frame();
        tracing::debug!(track = %kind, "track processor closed");
        true
    }

    pub fn is_stream_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// `true` once a shutdown request was confirmed, by the decode loop or by
    /// [`TrackProcessor::close`]. A track that finished or failed on its own is not closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.shared.state.lock(), TrackState::Failed(_))
    }

    /// Presentation timestamp (ms) of the last consumed frame.
    pub fn clock_ms(&self) -> u64 {
        self.shared.clock_ms.load(Ordering::Acquire)
    }

    pub fn is_frame_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TrackState {
        self.shared.state.lock().clone()
    }

    pub fn queued_packets(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn frames_produced(&self) -> u64 {
        self.shared.frames_produced.load(Ordering::Relaxed)
    }

    pub fn starved_events(&self) -> u64 {
        self.shared.starved_events.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> TrackStatus {
        TrackStatus {
            kind: self.shared.kind,
            state: self.state(),
            clock_ms: self.clock_ms(),
            queued_packets: self.queued_packets(),
            frames_produced: self.frames_produced(),
            starved_events: self.starved_events(),
        }
    }

    /// Consume the ready frame through `read`, advance the clock and wake the decode loop.
    ///
    /// Returns `None` without waiting when no frame is ready.
    pub(crate) fn take_ready<R>(&self, read: impl FnOnce(&T, u64) -> R) -> Option<R> {
        if !self.shared.ready.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.shared.slot.lock();
        if !self.shared.ready.load(Ordering::Acquire) {
            return None;
        }
        let out = read(&slot.data, slot.pts_ms);
        self.shared.clock_ms.store(slot.pts_ms, Ordering::Release);
        self.shared.ready.store(false, Ordering::Release);
        slot.input_wait = false;
        drop(slot);
        self.shared.cv.notify_all();
        Some(out)
    }

    /// Borrow the ready frame without consuming it.
    pub(crate) fn peek_ready(&self) -> Option<MappedMutexGuard<'_, T>> {
        if !self.shared.ready.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.shared.slot.lock();
        if !self.shared.ready.load(Ordering::Acquire) {
            return None;
        }
        Some(MutexGuard::map(slot, |s| &mut s.data))
    }

    /// Count a consumer starvation; returns `true` when the caller should log it.
    pub(crate) fn record_starvation(&self) -> bool {
        self.shared.starved_events.fetch_add(1, Ordering::Relaxed);
        self.shared.starve_warn.allow()
    }

    pub(crate) fn warn_interval(&self) -> std::time::Duration {
        self.config.warn_interval
    }

    fn release_ready_frame(&self) {
        let mut slot = self.shared.slot.lock();
        self.shared.ready.store(false, Ordering::Release);
        slot.input_wait = false;
    }
}

impl<T: Send + 'static> PacketSink for TrackProcessor<T> {
    fn kind(&self) -> TrackKind {
        TrackProcessor::kind(self)
    }

    fn push_packet(&self, item: QueueItem) {
        TrackProcessor::push_packet(self, item)
    }

    fn needs_packet(&self) -> bool {
        TrackProcessor::needs_packet(self)
    }

    fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

impl<T> Drop for TrackProcessor<T> {
    fn drop(&mut self) {
        self.shared.request_shutdown();
    }
}

enum Step {
    Produced,
    Continue,
    Starved,
    Finished,
}

enum LoopExit {
    Finished,
    Shutdown,
}

/// State owned by the decode thread.
struct DecodeWorker<E: DecodeEngine, F: FrameFinisher<E::Frame>> {
    shared: Arc<TrackShared<F::Output>>,
    engine: E,
    finisher: F,
    time_base: TimeBase,
    /// Oldest input the engine refused with `BufferFull`; retried before anything new.
    pending: Option<QueueItem>,
    input_ended: bool,
    last_pts_ms: Option<u64>,
    /// Producer-side buffer, swapped with the slot on publish.
    scratch: F::Output,
}

impl<E: DecodeEngine, F: FrameFinisher<E::Frame>> DecodeWorker<E, F> {
    fn run(mut self) {
        let kind = self.shared.kind;
        let outcome = self.decode_loop();

        let dropped = self.shared.queue.clear() + usize::from(self.pending.take().is_some());
        if dropped > 0 {
            tracing::debug!(track = %kind, dropped, "released undecoded packets");
        }

        match outcome {
            Ok(LoopExit::Finished) => {
                self.shared.finished.store(true, Ordering::SeqCst);
                self.shared.set_state(TrackState::Finished);
                tracing::info!(
                    track = %kind,
                    frames = self.shared.frames_produced.load(Ordering::Relaxed),
                    "stream finished"
                );
                self.shared.emit(PipelineEvent::TrackFinished(kind));
            }
            Ok(LoopExit::Shutdown) => {
                self.shared.closed.store(true, Ordering::SeqCst);
                self.shared.set_state(TrackState::Closed);
                tracing::debug!(track = %kind, "decode loop observed shutdown");
                self.shared.emit(PipelineEvent::TrackClosed(kind));
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(track = %kind, "decode loop failed: {reason}");
                self.shared.set_state(TrackState::Failed(reason.clone()));
                self.shared.emit(PipelineEvent::TrackFailed { kind, reason });
            }
        }
        self.shared.exited.store(true, Ordering::SeqCst);
    }

    fn decode_loop(&mut self) -> Result<LoopExit> {
        loop {
            if !self.wait_for_work() {
                return Ok(LoopExit::Shutdown);
            }
            match self.step()? {
                Step::Produced | Step::Continue => {}
                Step::Starved => self.park_until_input(),
                Step::Finished => return Ok(LoopExit::Finished),
            }
        }
    }

    /// Block while the slot is occupied or the loop is parked on an empty queue.
    ///
    /// Returns `false` when shutdown was requested.
    fn wait_for_work(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        while !self.shared.is_shutdown()
            && (self.shared.ready.load(Ordering::Acquire) || slot.input_wait)
        {
            self.shared.cv.wait(&mut slot);
        }
        !self.shared.is_shutdown()
    }

    fn park_until_input(&self) {
        let mut slot = self.shared.slot.lock();
        // Re-checked under the slot lock: a push that raced with the pop has either
        // already landed in the queue or will clear `input_wait` after we release.
        if self.shared.queue.is_empty() {
            slot.input_wait = true;
        }
    }

    fn step(&mut self) -> Result<Step> {
        let kind = self.shared.kind;
        let mut starved = false;

        if self.pending.is_none() && !self.input_ended {
            match self.shared.queue.pop() {
                Some(item) => {
                    if item.is_end_marker() {
                        tracing::debug!(track = %kind, "end marker reached; flushing decoder");
                        self.input_ended = true;
                    }
                    self.pending = Some(item);
                }
                None => starved = true,
            }
        }

        if let Some(item) = self.pending.take() {
            match self.engine.submit(item).context("decoder rejected input")? {
                SubmitStatus::Accepted => {}
                SubmitStatus::BufferFull(item) => {
                    tracing::trace!(track = %kind, "decoder buffers full; retrying packet");
                    self.pending = Some(item);
                }
                SubmitStatus::InputClosed => {
                    tracing::debug!(track = %kind, "decoder no longer accepts input");
                }
            }
        }

        match self.engine.retrieve_frame().context("decoder failed to produce a frame")? {
            Retrieved::Frame(frame) => {
                if self.publish(frame)? {
                    Ok(Step::Produced)
                } else {
                    Ok(Step::Continue)
                }
            }
            Retrieved::NeedsMoreInput => {
                if self.input_ended && self.pending.is_none() {
                    tracing::warn!(track = %kind, "decoder asked for input after end of stream");
                    return Ok(Step::Finished);
                }
                tracing::trace!(track = %kind, "decoder needs more input");
                Ok(if starved { Step::Starved } else { Step::Continue })
            }
            Retrieved::Exhausted => {
                if !self.input_ended {
                    return Err(anyhow!("decoder reported end of stream before the end marker"));
                }
                Ok(Step::Finished)
            }
        }
    }

    /// Returns `false` when the finisher had nothing to hand over for `frame`.
    fn publish(&mut self, frame: E::Frame) -> Result<bool> {
        let stream_pts_ms = frame.pts().and_then(|ticks| self.time_base.to_millis(ticks));
        let finished = self
            .finisher
            .finish(&frame, stream_pts_ms, self.last_pts_ms, &mut self.scratch)
            .context("finishing decoded frame")?;
        drop(frame);
        let Some(pts_ms) = finished else {
            tracing::trace!(track = %self.shared.kind, "frame produced no output yet");
            return Ok(false);
        };

        let pts_ms = match self.last_pts_ms {
            Some(last) if pts_ms < last => {
                tracing::debug!(track = %self.shared.kind, pts_ms, last, "timestamp went backwards");
                last
            }
            _ => pts_ms,
        };
        self.last_pts_ms = Some(pts_ms);

        {
            let mut slot = self.shared.slot.lock();
            std::mem::swap(&mut slot.data, &mut self.scratch);
            slot.pts_ms = pts_ms;
            self.shared.ready.store(true, Ordering::Release);
        }
        self.shared.frames_produced.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(track = %self.shared.kind, pts_ms, "frame ready");
        Ok(true)
    }
}
