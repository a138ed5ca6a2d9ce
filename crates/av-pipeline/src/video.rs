//! Video variant of the track processor.
//!
//! Decoded pictures are converted into a [`PixelBuffer`] by a [`VideoConverter`]. Unlike
//! audio, consumption is paced by the sync loop: it peeks the ready picture, blits it, then
//! calls [`VideoTrackProcessor::consume_frame`].

use std::ops::Deref;
use std::time::Duration;

use anyhow::Result;
use parking_lot::MappedMutexGuard;

use crate::config::PipelineConfig;
use crate::engine::DecodeEngine;
use crate::packet::{QueueItem, TimeBase, TrackKind};
use crate::track::{FrameFinisher, PacketSink, TrackProcessor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling.
    #[default]
    Yuv420p,
    Rgba,
}

/// A converted picture ready for display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    /// Bytes per row, one entry per plane.
    pub strides: Vec<usize>,
}

impl PixelBuffer {
    /// Shape the planes for `width x height` in `format`.
    ///
    /// Allocation only happens when the geometry changes; otherwise buffers are reused.
    pub fn ensure_layout(&mut self, width: u32, height: u32, format: PixelFormat) {
        if self.width == width
            && self.height == height
            && self.format == format
            && !self.planes.is_empty()
        {
            return;
        }
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let shapes: Vec<(usize, usize)> = match format {
            PixelFormat::Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
            PixelFormat::Rgba => vec![(w * 4, h)],
        };
        self.planes = shapes.iter().map(|(stride, rows)| vec![0u8; stride * rows]).collect();
        self.strides = shapes.iter().map(|(stride, _)| *stride).collect();
        self.width = width;
        self.height = height;
        self.format = format;
    }

    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }
}

/// Converts decoded pictures into the display pixel format.
pub trait VideoConverter<F>: Send + 'static {
    fn convert(&mut self, frame: &F, out: &mut PixelBuffer) -> Result<()>;
}

/// Video finishing step: convert, then timestamp.
///
/// Frames without a usable timestamp are placed one nominal frame interval after the
/// previous picture.
struct ConvertFinisher<C> {
    converter: C,
    frame_interval_ms: u64,
}

impl<F, C> FrameFinisher<F> for ConvertFinisher<C>
where
    C: VideoConverter<F>,
{
    type Output = PixelBuffer;

    fn finish(
        &mut self,
        frame: &F,
        stream_pts_ms: Option<u64>,
        prev_pts_ms: Option<u64>,
        out: &mut PixelBuffer,
    ) -> Result<Option<u64>> {
        self.converter.convert(frame, out)?;
        Ok(Some(stream_pts_ms.unwrap_or_else(|| match prev_pts_ms {
            Some(prev) => prev + self.frame_interval_ms,
            None => 0,
        })))
    }
}

/// Track processor feeding the display refresh loop.
pub struct VideoTrackProcessor {
    track: TrackProcessor<PixelBuffer>,
    frame_rate: Option<f64>,
    refresh_interval: Duration,
}

impl VideoTrackProcessor {
    pub fn new<E, C>(
        time_base: TimeBase,
        frame_rate: Option<f64>,
        config: &PipelineConfig,
        engine: E,
        converter: C,
    ) -> Self
    where
        E: DecodeEngine,
        C: VideoConverter<E::Frame>,
    {
        let refresh_interval = config.refresh_interval(frame_rate);
        let finisher = ConvertFinisher {
            converter,
            frame_interval_ms: refresh_interval.as_millis() as u64,
        };
        Self {
            track: TrackProcessor::new(TrackKind::Video, time_base, config, engine, finisher),
            frame_rate,
            refresh_interval,
        }
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    /// Nominal time between two display refreshes.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Borrow the ready picture without consuming it.
    ///
    /// The decode loop cannot publish while the guard is held, so keep it short.
    pub fn peek_frame(&self) -> Option<MappedMutexGuard<'_, PixelBuffer>> {
        self.track.peek_ready()
    }

    /// Mark the ready picture as shown: advance the clock and wake the decode loop.
    ///
    /// Returns `false` if nothing was ready.
    pub fn consume_frame(&self) -> bool {
        if self.track.take_ready(|_, _| ()).is_some() {
            return true;
        }
        self.note_missed_refresh();
        false
    }

    /// Record a refresh tick that found no picture.
    pub(crate) fn note_missed_refresh(&self) {
        if self.track.record_starvation() {
            tracing::warn!(
                queued = self.track.queued_packets(),
                "video frame not ready; skipping display update"
            );
        }
    }
}

impl Deref for VideoTrackProcessor {
    type Target = TrackProcessor<PixelBuffer>;

    fn deref(&self) -> &Self::Target {
        &self.track
    }
}

impl PacketSink for VideoTrackProcessor {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn push_packet(&self, item: QueueItem) {
        self.track.push_packet(item)
    }

    fn needs_packet(&self) -> bool {
        self.track.needs_packet()
    }

    fn is_terminal(&self) -> bool {
        self.track.state().is_terminal()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{MockFrame, ScriptedEngine, packet, wait_until};

    /// Paints a 2x2 luma plane with the frame timestamp.
    pub(crate) struct StampConverter;

    impl VideoConverter<MockFrame> for StampConverter {
        fn convert(&mut self, frame: &MockFrame, out: &mut PixelBuffer) -> Result<()> {
            out.ensure_layout(2, 2, PixelFormat::Yuv420p);
            out.planes[0].fill(frame.pts.unwrap_or(0) as u8);
            Ok(())
        }
    }

    pub(crate) fn video_processor(config: &PipelineConfig, engine: ScriptedEngine) -> VideoTrackProcessor {
        VideoTrackProcessor::new(TimeBase::MILLIS, Some(25.0), config, engine, StampConverter)
    }

    #[test]
    fn ensure_layout_sizes_planes_once() {
        let mut pb = PixelBuffer::default();
        pb.ensure_layout(5, 3, PixelFormat::Yuv420p);
        assert_eq!(pb.strides, vec![5, 3, 3]);
        assert_eq!(pb.byte_len(), 15 + 6 + 6);

        let luma_ptr = pb.planes[0].as_ptr();
        pb.ensure_layout(5, 3, PixelFormat::Yuv420p);
        assert_eq!(pb.planes[0].as_ptr(), luma_ptr);

        pb.ensure_layout(4, 4, PixelFormat::Rgba);
        assert_eq!(pb.strides, vec![16]);
        assert_eq!(pb.byte_len(), 64);
    }

    #[test]
    fn peek_does_not_consume() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        video.start().unwrap();
        video.push_packet(QueueItem::Packet(packet(0, 40)));
        assert!(wait_until(Duration::from_secs(2), || video.is_frame_ready()));

        {
            let pic = video.peek_frame().unwrap();
            assert_eq!(pic.planes[0], vec![40u8; 4]);
        }
        assert!(video.is_frame_ready());
        assert_eq!(video.clock_ms(), 0);

        assert!(video.consume_frame());
        assert_eq!(video.clock_ms(), 40);
        assert!(video.peek_frame().is_none());
        assert!(video.close());
    }

    #[test]
    fn consume_without_frame_returns_false() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        assert!(!video.consume_frame());
        assert_eq!(video.starved_events(), 1);
        assert_eq!(video.clock_ms(), 0);
    }

    #[test]
    fn refresh_interval_follows_frame_rate() {
        let video = video_processor(&PipelineConfig::default(), ScriptedEngine::default());
        assert_eq!(video.refresh_interval(), Duration::from_millis(40));
        assert_eq!(video.frame_rate(), Some(25.0));
    }

    #[test]
    fn missing_timestamps_advance_by_frame_interval() {
        let mut finisher = ConvertFinisher {
            converter: StampConverter,
            frame_interval_ms: 40,
        };
        let frame = MockFrame { pts: None };
        let mut out = PixelBuffer::default();
        assert_eq!(finisher.finish(&frame, None, None, &mut out).unwrap(), Some(0));
        assert_eq!(finisher.finish(&frame, None, Some(80), &mut out).unwrap(), Some(120));
    }
}
