//! Packet reader: pulls from a [`PacketSource`] and routes packets to per-track sinks.
//!
//! The reader pulls while at least one live track is below its watermark, and otherwise
//! sleeps for the poll interval. A pulled packet whose queue is at the watermark is held
//! by the reader until that queue drains, so no queue grows past its watermark. Packets
//! for unrouted tracks, or for tracks that already stopped, are dropped. When the source
//! ends (or fails) every route receives exactly one end marker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::Sender;

use crate::engine::{PacketSource, SourceEvent};
use crate::packet::{Packet, QueueItem, TrackId};
use crate::status::PipelineEvent;
use crate::track::PacketSink;

/// Counters returned when the reader exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub routed: u64,
    /// Packets for tracks nobody consumes.
    pub discarded: u64,
    /// `true` when the source reached its natural end (not stopped early).
    pub reached_end: bool,
}

pub struct PacketReader {
    source: Box<dyn PacketSource>,
    routes: HashMap<TrackId, Arc<dyn PacketSink>>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    markers_sent: bool,
}

impl PacketReader {
    pub fn new(source: Box<dyn PacketSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            routes: HashMap::new(),
            poll_interval,
            stop: Arc::new(AtomicBool::new(false)),
            markers_sent: false,
        }
    }

    /// Deliver packets of `track` to `sink`.
    pub fn route(mut self, track: TrackId, sink: Arc<dyn PacketSink>) -> Self {
        self.routes.insert(track, sink);
        self
    }

    /// Flag that makes [`PacketReader::run`] return at its next iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn any_live_needs_packet(&self) -> bool {
        self.routes
            .values()
            .any(|sink| !sink.is_terminal() && sink.needs_packet())
    }

    fn all_routes_terminal(&self) -> bool {
        self.routes.values().all(|sink| sink.is_terminal())
    }

    /// Push `packet` to its track, or hand it back while that queue is at its watermark.
    fn offer(&self, packet: Packet, summary: &mut ReaderSummary) -> Option<Packet> {
        let Some(sink) = self.routes.get(&packet.track) else {
            tracing::debug!(track = %packet.track, "discarding packet for unrouted track");
            summary.discarded += 1;
            return None;
        };
        if sink.is_terminal() {
            tracing::trace!(track = %packet.track, "discarding packet for stopped track");
            summary.discarded += 1;
            None
        } else if sink.needs_packet() {
            sink.push_packet(QueueItem::Packet(packet));
            summary.routed += 1;
            None
        } else {
            Some(packet)
        }
    }

    fn send_end_markers(&mut self) {
        if self.markers_sent {
            return;
        }
        self.markers_sent = true;
        for (track, sink) in &self.routes {
            tracing::debug!(%track, kind = %sink.kind(), "pushing end marker");
            sink.push_packet(QueueItem::EndMarker);
        }
    }

    /// Read until end of stream, a source error, or a stop request.
    ///
    /// Source errors are returned after the end markers went out, so the tracks still
    /// drain and finish.
    pub fn run(&mut self) -> Result<ReaderSummary> {
        if self.routes.is_empty() {
            bail!("packet reader has no track routes");
        }
        tracing::info!(tracks = self.routes.len(), "packet reader started");

        let mut summary = ReaderSummary::default();
        let mut held: Option<Packet> = None;
        while !self.stop.load(Ordering::Relaxed) {
            if let Some(packet) = held.take() {
                held = self.offer(packet, &mut summary);
                if held.is_some() {
                    thread::sleep(self.poll_interval);
                }
                continue;
            }
            if self.all_routes_terminal() {
                tracing::info!("every routed track stopped; packet reader exits");
                break;
            }
            if !self.any_live_needs_packet() {
                thread::sleep(self.poll_interval);
                continue;
            }

            let event = match self.source.next_packet().context("read next packet") {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(routed = summary.routed, "packet source failed: {e:#}");
                    self.send_end_markers();
                    return Err(e);
                }
            };

            match event {
                SourceEvent::Packet(packet) => held = self.offer(packet, &mut summary),
                SourceEvent::EndOfStream => {
                    summary.reached_end = true;
                    self.send_end_markers();
                    break;
                }
            }
        }

        tracing::info!(
            routed = summary.routed,
            discarded = summary.discarded,
            reached_end = summary.reached_end,
            "packet reader finished"
        );
        Ok(summary)
    }

    /// Run on a named thread, publishing the outcome to `events`.
    pub fn spawn(mut self, events: Option<Sender<PipelineEvent>>) -> Result<ReaderHandle> {
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("packet-reader".into())
            .spawn(move || {
                let result = self.run();
                if let Some(tx) = events {
                    let event = match &result {
                        Ok(_) => PipelineEvent::ReaderFinished,
                        Err(e) => PipelineEvent::ReaderFailed(format!("{e:#}")),
                    };
                    let _ = tx.send(event);
                }
                result
            })
            .context("spawn packet reader thread")?;
        Ok(ReaderHandle { stop, handle })
    }
}

/// Owner side of a spawned [`PacketReader`].
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<ReaderSummary>>,
}

impl ReaderHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<ReaderSummary> {
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("packet reader thread panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TrackKind;
    use crate::test_support::{VecSource, packet};
    use parking_lot::Mutex;

    /// Records everything pushed to it; needs packets while below `cap`.
    struct RecordingSink {
        kind: TrackKind,
        cap: usize,
        items: Mutex<Vec<QueueItem>>,
        terminal: AtomicBool,
    }

    impl RecordingSink {
        fn new(kind: TrackKind, cap: usize) -> Arc<Self> {
            Arc::new(Self {
                kind,
                cap,
                items: Mutex::new(Vec::new()),
                terminal: AtomicBool::new(false),
            })
        }

        fn pts(&self) -> Vec<i64> {
            self.items
                .lock()
                .iter()
                .filter_map(|item| match item {
                    QueueItem::Packet(p) => p.pts,
                    QueueItem::EndMarker => None,
                })
                .collect()
        }

        fn end_markers(&self) -> usize {
            self.items.lock().iter().filter(|i| i.is_end_marker()).count()
        }
    }

    impl PacketSink for RecordingSink {
        fn kind(&self) -> TrackKind {
            self.kind
        }

        fn push_packet(&self, item: QueueItem) {
            self.items.lock().push(item);
        }

        fn needs_packet(&self) -> bool {
            self.items.lock().len() < self.cap
        }

        fn is_terminal(&self) -> bool {
            self.terminal.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn routes_by_track_and_discards_unknown() {
        let audio = RecordingSink::new(TrackKind::Audio, usize::MAX);
        let video = RecordingSink::new(TrackKind::Video, usize::MAX);
        let source = VecSource::new(vec![
            packet(1, 0),
            packet(0, 0),
            packet(7, 5),
            packet(1, 20),
            packet(0, 40),
        ]);
        let mut reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(0), video.clone())
            .route(TrackId(1), audio.clone());

        let summary = reader.run().unwrap();
        assert_eq!(summary.routed, 4);
        assert_eq!(summary.discarded, 1);
        assert!(summary.reached_end);
        assert_eq!(audio.pts(), vec![0, 20]);
        assert_eq!(video.pts(), vec![0, 40]);
        assert_eq!(audio.end_markers(), 1);
        assert_eq!(video.end_markers(), 1);
    }

    #[test]
    fn end_markers_are_sent_once_on_source_failure() {
        let sink = RecordingSink::new(TrackKind::Audio, usize::MAX);
        let mut source = VecSource::new(vec![packet(1, 0), packet(1, 10)]);
        source.fail_after = Some(1);
        let mut reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(1), sink.clone());

        assert!(reader.run().is_err());
        reader.send_end_markers();
        assert_eq!(sink.pts(), vec![0]);
        assert_eq!(sink.end_markers(), 1);
    }

    #[test]
    fn run_without_routes_is_an_error() {
        let mut reader = PacketReader::new(Box::new(VecSource::new(vec![])), Duration::from_millis(1));
        assert!(reader.run().is_err());
    }

    #[test]
    fn waits_while_tracks_are_full_and_stops_on_request() {
        let sink = RecordingSink::new(TrackKind::Video, 2);
        let source = VecSource::new((0..10).map(|n| packet(0, n)).collect());
        let reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(0), sink.clone());
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = reader.spawn(Some(tx)).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.pts(), vec![0, 1]);
        assert!(!handle.is_finished());

        handle.stop();
        let summary = handle.join().unwrap();
        assert_eq!(summary.routed, 2);
        assert!(!summary.reached_end);
        assert_eq!(sink.end_markers(), 0);
        assert_eq!(rx.try_recv().unwrap(), PipelineEvent::ReaderFinished);
    }

    #[test]
    fn spawned_reader_reports_failure() {
        let sink = RecordingSink::new(TrackKind::Audio, usize::MAX);
        let mut source = VecSource::new(vec![packet(1, 0)]);
        source.fail_after = Some(0);
        let reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(1), sink.clone());
        let (tx, rx) = crossbeam_channel::unbounded();

        let handle = reader.spawn(Some(tx)).unwrap();
        assert!(handle.join().is_err());
        match rx.try_recv().unwrap() {
            PipelineEvent::ReaderFailed(reason) => assert!(reason.contains("container read error")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sink.end_markers(), 1);
    }

    #[test]
    fn full_track_holds_the_reader_instead_of_overfilling() {
        let video = RecordingSink::new(TrackKind::Video, 1);
        let audio = RecordingSink::new(TrackKind::Audio, usize::MAX);
        let source = VecSource::new(vec![packet(0, 0), packet(0, 40), packet(1, 0), packet(1, 20)]);
        let reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(0), video.clone())
            .route(TrackId(1), audio.clone());
        let handle = reader.spawn(None).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(video.pts(), vec![0]);
        assert!(audio.pts().is_empty());
        assert!(!handle.is_finished());

        handle.stop();
        let summary = handle.join().unwrap();
        assert_eq!(summary.routed, 1);
        assert!(!summary.reached_end);
    }

    #[test]
    fn stopped_track_no_longer_blocks_the_others() {
        let video = RecordingSink::new(TrackKind::Video, 1);
        let audio = RecordingSink::new(TrackKind::Audio, usize::MAX);
        video.terminal.store(true, Ordering::SeqCst);
        let mut packets = Vec::new();
        for n in 0..5 {
            packets.push(packet(0, n * 40));
            packets.push(packet(1, n * 20));
        }
        let mut reader = PacketReader::new(Box::new(VecSource::new(packets)), Duration::from_millis(1))
            .route(TrackId(0), video.clone())
            .route(TrackId(1), audio.clone());

        let summary = reader.run().unwrap();
        assert_eq!(audio.pts(), vec![0, 20, 40, 60, 80]);
        assert!(video.pts().is_empty());
        assert_eq!(summary.routed, 5);
        assert_eq!(summary.discarded, 5);
        assert!(summary.reached_end);
    }

    #[test]
    fn reader_exits_once_every_track_stopped() {
        let sink = RecordingSink::new(TrackKind::Audio, 2);
        sink.terminal.store(true, Ordering::SeqCst);
        let source = VecSource::new((0..10).map(|n| packet(1, n)).collect());
        let mut reader = PacketReader::new(Box::new(source), Duration::from_millis(1))
            .route(TrackId(1), sink.clone());

        let summary = reader.run().unwrap();
        assert_eq!(summary.routed, 0);
        assert!(!summary.reached_end);
        assert_eq!(sink.end_markers(), 0);
    }
}
